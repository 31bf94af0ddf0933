//! MLflow tracking over its REST API (`/api/2.0/mlflow/...`).
//!
//! Experiments are looked up by name and created on first use. Artifacts go
//! through the tracking server's artifact proxy, so the server must run with
//! artifact serving enabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use defilab_core::strategy::ParamPoint;

use super::{RunStatus, SinkError, TrackingSink};

/// MLflow caps a log-batch request at 1000 metrics.
const MAX_BATCH: usize = 1000;

pub struct MlflowSink {
    client: Client,
    base: String,
    experiments: Mutex<HashMap<String, String>>,
    /// run_id → experiment_id, needed for artifact paths.
    runs: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperiment {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateRun {
    run: RunEnvelope,
}

#[derive(Deserialize)]
struct RunEnvelope {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
}

impl MlflowSink {
    pub fn new(uri: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base: uri.into().trim_end_matches('/').to_string(),
            experiments: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{path}", self.base)
    }

    fn send(request: RequestBuilder) -> Result<reqwest::blocking::Response, SinkError> {
        let resp = request.send().map_err(|e| SinkError::Http(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn post(&self, path: &str, body: &Value) -> Result<reqwest::blocking::Response, SinkError> {
        Self::send(self.client.post(self.api(path)).json(body))
    }

    fn lookup_experiment(&self, name: &str) -> Result<Option<String>, SinkError> {
        let lookup = Self::send(
            self.client
                .get(self.api("experiments/get-by-name"))
                .query(&[("experiment_name", name)]),
        );
        match lookup {
            Ok(resp) => Ok(Some(
                resp.json::<ExperimentEnvelope>()
                    .map_err(|e| SinkError::Http(e.to_string()))?
                    .experiment
                    .experiment_id,
            )),
            Err(SinkError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn create_experiment(&self, name: &str) -> Result<String, SinkError> {
        debug!(experiment = name, "creating mlflow experiment");
        Ok(self
            .post("experiments/create", &json!({ "name": name }))?
            .json::<CreateExperiment>()
            .map_err(|e| SinkError::Http(e.to_string()))?
            .experiment_id)
    }

    /// Cached id for `name`, creating the experiment on first use.
    ///
    /// The cache lock is held across lookup and create, so one sink creates
    /// each experiment at most once however many workers start runs.
    fn experiment_id(&self, name: &str) -> Result<String, SinkError> {
        let mut experiments = self.experiments.lock().map_err(|_| SinkError::Poisoned)?;
        if let Some(id) = experiments.get(name) {
            return Ok(id.clone());
        }

        let id = match self.lookup_experiment(name)? {
            Some(id) => id,
            None => match self.create_experiment(name) {
                Ok(id) => id,
                // Another client created it after our lookup.
                Err(SinkError::Rejected { status, body })
                    if status == StatusCode::BAD_REQUEST.as_u16() =>
                {
                    self.lookup_experiment(name)?
                        .ok_or(SinkError::Rejected { status, body })?
                }
                Err(e) => return Err(e),
            },
        };

        experiments.insert(name.to_string(), id.clone());
        Ok(id)
    }
}

impl TrackingSink for MlflowSink {
    fn start_run(
        &self,
        experiment: &str,
        run_name: &str,
        params: &ParamPoint,
    ) -> Result<String, SinkError> {
        let experiment_id = self.experiment_id(experiment)?;
        let run_id = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": Utc::now().timestamp_millis(),
                }),
            )?
            .json::<CreateRun>()
            .map_err(|e| SinkError::Http(e.to_string()))?
            .run
            .info
            .run_id;

        let params: Vec<Value> = params
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v.to_string() }))
            .collect();
        self.post(
            "runs/log-batch",
            &json!({ "run_id": run_id, "params": params }),
        )?;

        self.runs
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .insert(run_id.clone(), experiment_id);
        Ok(run_id)
    }

    fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<(), SinkError> {
        let timestamp = Utc::now().timestamp_millis();
        let entries: Vec<Value> = metrics
            .iter()
            // MLflow rejects NaN/inf.
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| json!({ "key": k, "value": v, "timestamp": timestamp, "step": 0 }))
            .collect();
        for chunk in entries.chunks(MAX_BATCH) {
            self.post(
                "runs/log-batch",
                &json!({ "run_id": run_id, "metrics": chunk }),
            )?;
        }
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, name: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let experiment_id = self
            .runs
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .get(run_id)
            .cloned()
            .ok_or_else(|| SinkError::UnknownRun(run_id.to_string()))?;
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{experiment_id}/{run_id}/artifacts/{name}",
            self.base
        );
        Self::send(self.client.put(url).body(bytes.to_vec()))?;
        Ok(())
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), SinkError> {
        self.post(
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": Utc::now().timestamp_millis(),
            }),
        )?;
        self.runs
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;

    // ── In-process tracking server ──────────────────────────────────

    #[derive(Default)]
    struct FakeServer {
        experiments: HashMap<String, String>,
        /// Names whose next lookup reports 404 even if they exist.
        hide_once: HashSet<String>,
        lookups: usize,
        creates: usize,
        runs: usize,
    }

    fn serve(state: Arc<Mutex<FakeServer>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = Arc::clone(&state);
                thread::spawn(move || handle(stream, &state));
            }
        });
        format!("http://{addr}")
    }

    fn handle(mut stream: TcpStream, state: &Mutex<FakeServer>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();
        let mut length = 0;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).unwrap();
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    length = value.trim().parse().unwrap();
                }
            }
        }
        let mut body = vec![0; length];
        reader.read_exact(&mut body).unwrap();

        let target = request_line.split_whitespace().nth(1).unwrap_or_default();
        let (status, reply) = route(target, &body, state);
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
            reply.len()
        )
        .unwrap();
        stream.flush().unwrap();
    }

    fn route(target: &str, body: &[u8], state: &Mutex<FakeServer>) -> (&'static str, String) {
        let mut s = state.lock().unwrap();
        if let Some(name) =
            target.strip_prefix("/api/2.0/mlflow/experiments/get-by-name?experiment_name=")
        {
            s.lookups += 1;
            if s.hide_once.remove(name) {
                return ("404 Not Found", json!({ "error_code": "RESOURCE_DOES_NOT_EXIST" }).to_string());
            }
            return match s.experiments.get(name) {
                Some(id) => ("200 OK", json!({ "experiment": { "experiment_id": id } }).to_string()),
                None => ("404 Not Found", json!({ "error_code": "RESOURCE_DOES_NOT_EXIST" }).to_string()),
            };
        }

        let body: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        match target {
            "/api/2.0/mlflow/experiments/create" => {
                let name = body["name"].as_str().unwrap_or_default().to_string();
                if s.experiments.contains_key(&name) {
                    return ("400 Bad Request", json!({ "error_code": "RESOURCE_ALREADY_EXISTS" }).to_string());
                }
                s.creates += 1;
                let id = (s.experiments.len() + 1).to_string();
                s.experiments.insert(name, id.clone());
                ("200 OK", json!({ "experiment_id": id }).to_string())
            }
            "/api/2.0/mlflow/runs/create" => {
                s.runs += 1;
                let run_id = format!("r{}", s.runs);
                ("200 OK", json!({ "run": { "info": { "run_id": run_id } } }).to_string())
            }
            "/api/2.0/mlflow/runs/log-batch" | "/api/2.0/mlflow/runs/update" => {
                ("200 OK", "{}".to_string())
            }
            _ => ("404 Not Found", "{}".to_string()),
        }
    }

    // ── Experiments ─────────────────────────────────────────────────

    #[test]
    fn concurrent_runs_create_the_experiment_once() {
        let state = Arc::new(Mutex::new(FakeServer::default()));
        let sink = MlflowSink::new(serve(Arc::clone(&state)), Duration::from_secs(5)).unwrap();
        let params = ParamPoint::from([("X".to_string(), 1.0)]);

        let run_ids: Vec<String> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let sink = &sink;
                    let params = &params;
                    scope.spawn(move || sink.start_run("grid", &format!("point-{i}"), params))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        assert_eq!(run_ids.iter().collect::<HashSet<_>>().len(), 8);
        let s = state.lock().unwrap();
        assert_eq!(s.creates, 1);
        assert_eq!(s.lookups, 1);
        assert_eq!(s.runs, 8);
    }

    #[test]
    fn create_conflict_falls_back_to_lookup() {
        let state = Arc::new(Mutex::new(FakeServer::default()));
        {
            let mut s = state.lock().unwrap();
            s.experiments.insert("grid".to_string(), "42".to_string());
            s.hide_once.insert("grid".to_string());
        }
        let sink = MlflowSink::new(serve(Arc::clone(&state)), Duration::from_secs(5)).unwrap();

        assert_eq!(sink.experiment_id("grid").unwrap(), "42");
        let s = state.lock().unwrap();
        assert_eq!(s.lookups, 2);
        assert_eq!(s.creates, 0);
    }

    #[test]
    fn run_records_its_experiment_for_artifacts() {
        let state = Arc::new(Mutex::new(FakeServer::default()));
        let sink = MlflowSink::new(serve(state), Duration::from_secs(5)).unwrap();
        let run_id = sink.start_run("grid", "p", &ParamPoint::new()).unwrap();
        assert_eq!(sink.runs.lock().unwrap().get(&run_id).map(String::as_str), Some("1"));
        sink.end_run(&run_id, RunStatus::Finished).unwrap();
        assert!(sink.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn api_paths_strip_trailing_slash() {
        let sink = MlflowSink::new("http://localhost:5000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            sink.api("runs/create"),
            "http://localhost:5000/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn unreachable_server_is_a_sink_error() {
        // Port 9 (discard) on localhost refuses connections.
        let sink = MlflowSink::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = sink.start_run("e", "r", &ParamPoint::new()).unwrap_err();
        assert!(matches!(err, SinkError::Http(_) | SinkError::Rejected { .. }));
    }

    #[test]
    fn artifact_for_unknown_run_fails_locally() {
        let sink = MlflowSink::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            sink.log_artifact("nope", "a.csv", b""),
            Err(SinkError::UnknownRun(_))
        ));
    }
}
