//! Per-session Stratum state machine.
//!
//! Tracks subscription and authorization for one connection and turns each
//! request into a response. Share checks are split out as a [`ShareCheck`]
//! so the caller decides where the (possibly slow) hash oracle runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::parser::{Request, RequestId, Response, RpcError};
use crate::hasher::HashOracle;
use crate::job::{canonical_header, JobBook};
use crate::share::{difficulty_to_target, validate_hash, Target, HASH_LEN};
use crate::upstream::{AcceptedShare, Upstream};

/// Positional params of `mining.submit`: worker, job id, extranonce2, ntime, nonce.
const SUBMIT_PARAMS: usize = 5;

/// Collaborators shared by every session.
pub struct Backend {
    pub oracle: Arc<dyn HashOracle>,
    pub jobs: Arc<JobBook>,
    pub upstream: Arc<dyn Upstream>,
}

impl Backend {
    pub fn new(oracle: Arc<dyn HashOracle>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            oracle,
            jobs: Arc::new(JobBook::new()),
            upstream,
        }
    }
}

/// Per-session parameters handed out when a connection is accepted.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub difficulty: f64,
    pub extranonce2_size: usize,
    pub shutdown_grace: Duration,
}

/// State of one client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    pub subscribed: bool,
    pub worker: Option<String>,
    pub extranonce1: [u8; 4],
    pub extranonce2_size: usize,
    pub difficulty: f64,
    pub connected_at: DateTime<Utc>,
    pub accepted: u64,
    pub rejected: u64,
}

impl Session {
    /// The extranonce1 is derived from the session id, so it is unique among
    /// the first 2^32 sessions of a proxy run.
    pub fn new(id: u64, peer: SocketAddr, settings: &SessionSettings) -> Self {
        Self {
            id,
            peer,
            subscribed: false,
            worker: None,
            extranonce1: (id as u32).to_be_bytes(),
            extranonce2_size: settings.extranonce2_size,
            difficulty: settings.difficulty,
            connected_at: Utc::now(),
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.worker.is_some()
    }

    pub fn subscription_id(&self) -> String {
        format!("{:016x}", self.id)
    }

    pub fn target(&self) -> Target {
        difficulty_to_target(self.difficulty)
    }
}

/// What the caller must do to answer a request.
pub enum Step {
    /// Send this response.
    Reply(Response),
    /// Run the share check, then pass its outcome to [`StateMachine::finish`].
    Verify(ShareCheck),
}

/// A share waiting for its hash.
pub struct ShareCheck {
    id: RequestId,
    header: Vec<u8>,
    target: Target,
    share: AcceptedShare,
    oracle: Arc<dyn HashOracle>,
}

impl ShareCheck {
    /// Hash the header with the oracle and compare against the target.
    /// Blocks for as long as the oracle does.
    pub fn run(self) -> CheckedShare {
        let hash = self.oracle.hash(&self.header);
        let accepted = validate_hash(&hash, &self.target.to_be_bytes());
        CheckedShare {
            id: self.id,
            hash,
            accepted,
            share: self.share,
        }
    }
}

/// Outcome of a [`ShareCheck`].
pub struct CheckedShare {
    id: RequestId,
    hash: [u8; HASH_LEN],
    accepted: bool,
    share: AcceptedShare,
}

impl CheckedShare {
    pub fn accepted(&self) -> bool {
        self.accepted
    }
}

/// Stratum protocol state for a single connection.
pub struct StateMachine {
    session: Session,
    backend: Arc<Backend>,
}

impl StateMachine {
    pub fn new(session: Session, backend: Arc<Backend>) -> Self {
        Self { session, backend }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Change the difficulty applied to future submissions.
    ///
    /// Hook for a pool relay forwarding `mining.set_difficulty`; sessions
    /// otherwise keep the configured difficulty.
    pub fn set_difficulty(&mut self, difficulty: f64) {
        self.session.difficulty = difficulty;
    }

    /// Dispatch one request.
    pub fn handle(&mut self, request: Request) -> Step {
        let id = request.id.clone();
        match request.method.as_str() {
            "mining.subscribe" => Step::Reply(self.subscribe(id, &request)),
            "mining.authorize" => Step::Reply(self.authorize(id, &request)),
            "mining.submit" => self.submit(id, &request),
            "mining.extranonce.subscribe" => Step::Reply(Response::result(id, json!(true))),
            method => {
                warn!(peer = %self.session.peer, method, "Unknown method");
                Step::Reply(Response::error(id, RpcError::unknown_method()))
            }
        }
    }

    /// Record a checked share and build its response.
    pub fn finish(&mut self, checked: CheckedShare) -> Response {
        let CheckedShare {
            id,
            hash,
            accepted,
            mut share,
        } = checked;

        if accepted {
            self.session.accepted += 1;
            share.hash = hash;
            info!(
                peer = %self.session.peer,
                worker = %share.worker,
                job_id = %share.job_id,
                "Share accepted"
            );
            self.backend.upstream.relay_share(&share);
        } else {
            self.session.rejected += 1;
            info!(
                peer = %self.session.peer,
                worker = %share.worker,
                job_id = %share.job_id,
                hash = %hex::encode(hash),
                "Share rejected: above target"
            );
        }

        Response::result(id, Value::Bool(accepted))
    }

    /// Handle a request and run any share check inline.
    pub fn process(&mut self, request: Request) -> Response {
        match self.handle(request) {
            Step::Reply(response) => response,
            Step::Verify(check) => {
                let checked = check.run();
                self.finish(checked)
            }
        }
    }

    fn subscribe(&mut self, id: RequestId, request: &Request) -> Response {
        self.session.subscribed = true;
        let subscription_id = self.session.subscription_id();
        info!(
            peer = %self.session.peer,
            agent = request.str_param(0),
            subscription = %subscription_id,
            "Client subscribed"
        );

        Response::result(
            id,
            json!([
                [
                    ["mining.set_difficulty", subscription_id],
                    ["mining.notify", subscription_id]
                ],
                hex::encode(self.session.extranonce1),
                self.session.extranonce2_size
            ]),
        )
    }

    fn authorize(&mut self, id: RequestId, request: &Request) -> Response {
        let worker = request.str_param(0).to_string();
        info!(peer = %self.session.peer, worker = %worker, "Client authorized");
        self.session.worker = Some(worker);
        Response::result(id, json!(true))
    }

    fn submit(&mut self, id: RequestId, request: &Request) -> Step {
        if request.params.len() < SUBMIT_PARAMS {
            debug!(
                peer = %self.session.peer,
                params = request.params.len(),
                "Submit with too few params"
            );
            return Step::Reply(Response::error(id, RpcError::invalid_submit_params()));
        }
        if !self.session.subscribed {
            return Step::Reply(Response::error(id, RpcError::not_subscribed()));
        }
        if !self.session.is_authorized() {
            return Step::Reply(Response::error(id, RpcError::unauthorized_worker()));
        }

        let worker = request.str_param(0);
        let job_id = request.str_param(1);
        let extranonce2 = request.str_param(2);
        let ntime = request.str_param(3);
        let nonce = request.str_param(4);

        debug!(
            peer = %self.session.peer,
            worker,
            job_id,
            extranonce2,
            ntime,
            nonce,
            "Mining submit"
        );

        let header = match self.backend.jobs.get(job_id) {
            Some(job) => {
                match job.header(&self.session.extranonce1, extranonce2, ntime, nonce) {
                    Ok(header) => header,
                    Err(e) => {
                        debug!(peer = %self.session.peer, error = %e, "Malformed submit fields");
                        return Step::Reply(Response::error(id, RpcError::invalid_submit_params()));
                    }
                }
            }
            None => canonical_header(job_id, &self.session.extranonce1, extranonce2, ntime, nonce),
        };

        Step::Verify(ShareCheck {
            id,
            header,
            target: self.session.target(),
            share: AcceptedShare {
                worker: worker.to_string(),
                job_id: job_id.to_string(),
                extranonce1: self.session.extranonce1,
                extranonce2: extranonce2.to_string(),
                ntime: ntime.to_string(),
                nonce: nonce.to_string(),
                difficulty: self.session.difficulty,
                hash: [0; HASH_LEN],
            },
            oracle: Arc::clone(&self.backend.oracle),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::tests::sample_notify;
    use crate::job::Job;
    use crate::upstream::tests::RecordingUpstream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Oracle returning a fixed digest and remembering what it hashed.
    pub(crate) struct FixedOracle {
        pub digest: [u8; 32],
        pub calls: AtomicUsize,
        pub last_header: std::sync::Mutex<Vec<u8>>,
    }

    impl FixedOracle {
        pub(crate) fn new(digest: [u8; 32]) -> Arc<Self> {
            Arc::new(Self {
                digest,
                calls: AtomicUsize::new(0),
                last_header: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    impl HashOracle for FixedOracle {
        fn hash(&self, header: &[u8]) -> [u8; 32] {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_header.lock().unwrap() = header.to_vec();
            self.digest
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            difficulty: 1.0,
            extranonce2_size: 4,
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn machine_with(
        oracle: Arc<FixedOracle>,
    ) -> (StateMachine, Arc<RecordingUpstream>, Arc<Backend>) {
        let upstream = Arc::new(RecordingUpstream::default());
        let backend = Arc::new(Backend::new(oracle, upstream.clone()));
        let session = Session::new(1, "127.0.0.1:4000".parse().unwrap(), &settings());
        (
            StateMachine::new(session, Arc::clone(&backend)),
            upstream,
            backend,
        )
    }

    fn submit(id: u64, params: usize) -> Request {
        let fields = ["test.worker", "job123", "00000000", "507c0000", "00000000"];
        Request::new(
            id,
            "mining.submit",
            fields.iter().take(params).map(|f| json!(f)).collect(),
        )
    }

    fn ready(machine: &mut StateMachine) {
        machine.process(Request::new(1, "mining.subscribe", vec![json!("miner/1.0")]));
        machine.process(Request::new(2, "mining.authorize", vec![json!("test.worker"), json!("x")]));
    }

    #[test]
    fn test_subscribe_result() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        let response = machine.process(Request::new(1, "mining.subscribe", vec![]));

        assert!(machine.session().subscribed);
        assert!(response.error.is_none());
        assert_eq!(
            response.result,
            json!([
                [
                    ["mining.set_difficulty", "0000000000000001"],
                    ["mining.notify", "0000000000000001"]
                ],
                "00000001",
                4
            ])
        );
    }

    #[test]
    fn test_authorize_records_worker() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        let response = machine.process(Request::new(
            "auth",
            "mining.authorize",
            vec![json!("alice.rig1"), json!("password")],
        ));
        assert_eq!(response.result, json!(true));
        assert_eq!(response.id, RequestId::from("auth"));
        assert_eq!(machine.session().worker.as_deref(), Some("alice.rig1"));
        assert!(!machine.session().subscribed);
    }

    #[test]
    fn test_extranonce_subscribe() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        let response = machine.process(Request::new(9, "mining.extranonce.subscribe", vec![]));
        assert_eq!(response.result, json!(true));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_unknown_method() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        let response = machine.process(Request::new(5, "mining.foo", vec![]));
        assert_eq!(response.error, Some(RpcError::new(20, "Unknown method")));
        assert_eq!(response.result, Value::Null);
        assert_eq!(response.id, RequestId::from(5));
    }

    #[test]
    fn test_submit_too_few_params() {
        let oracle = FixedOracle::new([0; 32]);
        let (mut machine, _, _) = machine_with(oracle.clone());
        ready(&mut machine);

        let response = machine.process(submit(3, 4));
        assert_eq!(
            response.error,
            Some(RpcError::new(20, "Invalid submit parameters"))
        );
        assert_eq!(response.result, Value::Null);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_submit_hash_above_target_is_rejected() {
        let oracle = FixedOracle::new([0xFF; 32]);
        let (mut machine, upstream, _) = machine_with(oracle.clone());
        ready(&mut machine);

        let response = machine.process(submit(3, 5));
        assert_eq!(response.result, json!(false));
        assert!(response.error.is_none());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.session().rejected, 1);
        assert!(upstream.shares().is_empty());
    }

    #[test]
    fn test_submit_hash_below_target_is_accepted_and_relayed() {
        let oracle = FixedOracle::new([0; 32]);
        let (mut machine, upstream, _) = machine_with(oracle.clone());
        ready(&mut machine);

        let response = machine.process(submit(3, 5));
        assert_eq!(response.result, json!(true));
        assert_eq!(machine.session().accepted, 1);

        let shares = upstream.shares();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].worker, "test.worker");
        assert_eq!(shares[0].job_id, "job123");
        assert_eq!(shares[0].hash, [0; 32]);
    }

    #[test]
    fn test_submit_uses_session_difficulty() {
        // Just below the difficulty-1 target.
        let mut digest = [0u8; 32];
        digest[4] = 0xFF;
        digest[5] = 0xFE;
        let (mut machine, _, _) = machine_with(FixedOracle::new(digest));
        ready(&mut machine);

        assert_eq!(machine.process(submit(3, 5)).result, json!(true));

        machine.set_difficulty(2.0);
        assert_eq!(machine.process(submit(4, 5)).result, json!(false));
    }

    #[test]
    fn test_submit_requires_subscription() {
        let oracle = FixedOracle::new([0; 32]);
        let (mut machine, _, _) = machine_with(oracle.clone());
        machine.process(Request::new(1, "mining.authorize", vec![json!("w")]));

        let response = machine.process(submit(3, 5));
        assert_eq!(response.error, Some(RpcError::new(25, "Not subscribed")));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_submit_requires_authorization() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        machine.process(Request::new(1, "mining.subscribe", vec![]));

        let response = machine.process(submit(3, 5));
        assert_eq!(response.error, Some(RpcError::new(24, "Unauthorized worker")));
    }

    #[test]
    fn test_authorize_before_subscribe_allows_submit() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        machine.process(Request::new(1, "mining.authorize", vec![json!("w")]));
        machine.process(Request::new(2, "mining.subscribe", vec![]));
        assert_eq!(machine.process(submit(3, 5)).result, json!(true));
    }

    #[test]
    fn test_submit_for_unknown_job_hashes_canonical_fields() {
        let oracle = FixedOracle::new([0; 32]);
        let (mut machine, _, _) = machine_with(oracle.clone());
        ready(&mut machine);
        machine.process(submit(3, 5));

        assert_eq!(
            *oracle.last_header.lock().unwrap(),
            b"job1230000000100000000507c000000000000".to_vec()
        );
    }

    #[test]
    fn test_submit_for_known_job_hashes_block_header() {
        let oracle = FixedOracle::new([0; 32]);
        let (mut machine, _, backend) = machine_with(oracle.clone());
        backend
            .jobs
            .publish(Job::from_notify_params(&sample_notify("job123", true)).unwrap());
        ready(&mut machine);

        assert_eq!(machine.process(submit(3, 5)).result, json!(true));
        let header = oracle.last_header.lock().unwrap().clone();
        assert_eq!(header.len(), 80);
        assert_eq!(&header[76..80], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_submit_for_known_job_with_bad_hex() {
        let oracle = FixedOracle::new([0; 32]);
        let (mut machine, _, backend) = machine_with(oracle.clone());
        backend
            .jobs
            .publish(Job::from_notify_params(&sample_notify("job123", true)).unwrap());
        ready(&mut machine);

        let request = Request::new(
            3,
            "mining.submit",
            vec![
                json!("test.worker"),
                json!("job123"),
                json!("zz"),
                json!("507c0000"),
                json!("00000000"),
            ],
        );
        let response = machine.process(request);
        assert_eq!(response.error, Some(RpcError::invalid_submit_params()));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_response_id_echoes_request_id() {
        let (mut machine, _, _) = machine_with(FixedOracle::new([0; 32]));
        for id in [RequestId::from(42), RequestId::from("req-7"), RequestId::Null] {
            for method in ["mining.subscribe", "mining.foo", "mining.submit"] {
                let request = Request {
                    id: id.clone(),
                    method: method.to_string(),
                    params: vec![],
                };
                assert_eq!(machine.process(request).id, id);
            }
        }
    }
}
