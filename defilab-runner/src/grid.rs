//! Cartesian hyperparameter grids.
//!
//! Points are generated in a stable order: axes sorted by name, the last
//! axis varying fastest. Constraint-violating combinations are skipped
//! during expansion, never materialized.

use std::fmt;
use std::sync::Arc;

use defilab_core::strategy::ParamPoint;

use crate::config::{ConfigError, GridConstraint, GridSpec};

type Predicate = Arc<dyn Fn(&ParamPoint) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct ParamGrid {
    axes: Vec<(String, Vec<f64>)>,
    constraints: Vec<GridConstraint>,
    predicate: Option<Predicate>,
}

impl fmt::Debug for ParamGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamGrid")
            .field("axes", &self.axes)
            .field("constraints", &self.constraints)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: &GridSpec) -> Result<Self, ConfigError> {
        let mut grid = Self::new();
        for (name, axis) in &spec.axes {
            grid = grid.axis(name.clone(), axis.values()?);
        }
        for constraint in &spec.constraints {
            grid = grid.constraint(constraint.clone());
        }
        Ok(grid)
    }

    /// Adds or replaces an axis.
    pub fn axis(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        let name = name.into();
        self.axes.retain(|(n, _)| *n != name);
        self.axes.push((name, values));
        self.axes.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }

    pub fn constraint(mut self, constraint: GridConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Caller-supplied filter, applied after the declarative constraints.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ParamPoint) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Number of combinations before filtering.
    pub fn size(&self) -> usize {
        self.axes.iter().map(|(_, v)| v.len()).product()
    }

    pub fn points(&self) -> Vec<ParamPoint> {
        if self.axes.iter().any(|(_, v)| v.is_empty()) {
            return Vec::new();
        }

        let mut points = Vec::new();
        let mut idx = vec![0usize; self.axes.len()];
        loop {
            let point: ParamPoint = self
                .axes
                .iter()
                .zip(&idx)
                .map(|((name, values), &i)| (name.clone(), values[i]))
                .collect();
            if self.accepts(&point) {
                points.push(point);
            }

            // Odometer increment, last axis fastest.
            let mut carry = true;
            for pos in (0..idx.len()).rev() {
                idx[pos] += 1;
                if idx[pos] < self.axes[pos].1.len() {
                    carry = false;
                    break;
                }
                idx[pos] = 0;
            }
            if carry {
                break;
            }
        }
        points
    }

    fn accepts(&self, point: &ParamPoint) -> bool {
        let ordered = self.constraints.iter().all(|c| {
            let values: Vec<f64> = c
                .names()
                .iter()
                .filter_map(|n| point.get(n).copied())
                .collect();
            match c {
                GridConstraint::StrictlyIncreasing(_) => values.windows(2).all(|w| w[0] < w[1]),
                GridConstraint::NonDecreasing(_) => values.windows(2).all(|w| w[0] <= w[1]),
            }
        });
        ordered && self.predicate.as_ref().map_or(true, |p| p(point))
    }
}
