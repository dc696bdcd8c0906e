//! Mining jobs and block header assembly.
//!
//! Jobs arrive from the upstream pool as `mining.notify` parameters. The
//! proxy keeps the live ones in a [`JobBook`] so submissions can be turned
//! back into the exact header bytes the miner hashed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::hasher::sha256d;

/// Errors parsing jobs or submission fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("mining.notify needs 9 params, got {0}")]
    TooFewParams(usize),

    #[error("{0} is not a string")]
    NotAString(&'static str),

    #[error("{0} is not an array")]
    NotAnArray(&'static str),

    #[error("{field} is not valid hex: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("{field} must be {expected} bytes, got {actual}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("clean_jobs is not a bool")]
    CleanJobsNotBool,
}

/// A unit of work offered to miners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    /// Previous block hash, in header byte order.
    pub prev_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
}

impl Job {
    /// Parse from `mining.notify` params:
    /// `[job_id, prevhash, coinb1, coinb2, merkle_branch[], version, nbits, ntime, clean_jobs]`.
    pub fn from_notify_params(params: &[Value]) -> Result<Self, JobError> {
        if params.len() < 9 {
            return Err(JobError::TooFewParams(params.len()));
        }

        let job_id = str_param(&params[0], "job_id")?.to_string();
        let prev_hash = word_swap(hex_array(str_param(&params[1], "prev_hash")?, "prev_hash")?);
        let coinbase1 = hex_bytes(str_param(&params[2], "coinbase1")?, "coinbase1")?;
        let coinbase2 = hex_bytes(str_param(&params[3], "coinbase2")?, "coinbase2")?;

        let merkle_branches = params[4]
            .as_array()
            .ok_or(JobError::NotAnArray("merkle_branches"))?
            .iter()
            .map(|branch| hex_array(str_param(branch, "merkle_branch")?, "merkle_branch"))
            .collect::<Result<Vec<_>, _>>()?;

        let version = hex_u32(str_param(&params[5], "version")?, "version")?;
        let nbits = hex_u32(str_param(&params[6], "nbits")?, "nbits")?;
        let ntime = hex_u32(str_param(&params[7], "ntime")?, "ntime")?;
        let clean_jobs = params[8].as_bool().ok_or(JobError::CleanJobsNotBool)?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }

    /// Merkle root for a coinbase built with the given extranonces.
    pub fn merkle_root(&self, extranonce1: &[u8], extranonce2: &[u8]) -> [u8; 32] {
        let mut coinbase = Vec::with_capacity(
            self.coinbase1.len() + extranonce1.len() + extranonce2.len() + self.coinbase2.len(),
        );
        coinbase.extend_from_slice(&self.coinbase1);
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&self.coinbase2);

        let mut root = sha256d(&coinbase);
        let mut pair = [0u8; 64];
        for branch in &self.merkle_branches {
            pair[..32].copy_from_slice(&root);
            pair[32..].copy_from_slice(branch);
            root = sha256d(&pair);
        }
        root
    }

    /// Assemble the 80-byte block header for a submission.
    ///
    /// `extranonce2`, `ntime` and `nonce` are the hex strings the miner sent.
    pub fn header(
        &self,
        extranonce1: &[u8],
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> Result<Vec<u8>, JobError> {
        let extranonce2 = hex_bytes(extranonce2, "extranonce2")?;
        let ntime = hex_u32(ntime, "ntime")?;
        let nonce = hex_u32(nonce, "nonce")?;

        let mut header = Vec::with_capacity(80);
        header.extend_from_slice(&self.version.to_le_bytes());
        header.extend_from_slice(&self.prev_hash);
        header.extend_from_slice(&self.merkle_root(extranonce1, &extranonce2));
        header.extend_from_slice(&ntime.to_le_bytes());
        header.extend_from_slice(&self.nbits.to_le_bytes());
        header.extend_from_slice(&nonce.to_le_bytes());
        Ok(header)
    }
}

/// Header bytes for a submission whose job the proxy has never seen.
///
/// Concatenates the submitted text fields with the session's extranonce1 so
/// every distinct submission hashes differently.
pub fn canonical_header(
    job_id: &str,
    extranonce1: &[u8],
    extranonce2: &str,
    ntime: &str,
    nonce: &str,
) -> Vec<u8> {
    let extranonce1 = hex::encode(extranonce1);
    [job_id, extranonce1.as_str(), extranonce2, ntime, nonce]
        .concat()
        .into_bytes()
}

/// Jobs currently valid for submission, keyed by job id.
#[derive(Debug, Default)]
pub struct JobBook {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. A job with `clean_jobs` set retires every earlier job.
    pub fn publish(&self, job: Job) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if job.clean_jobs {
            debug!(retired = jobs.len(), "Clean job received, dropping old jobs");
            jobs.clear();
        }
        debug!(job_id = %job.job_id, "Job published");
        jobs.insert(job.job_id.clone(), Arc::new(job));
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn str_param<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, JobError> {
    value.as_str().ok_or(JobError::NotAString(field))
}

fn hex_bytes(s: &str, field: &'static str) -> Result<Vec<u8>, JobError> {
    hex::decode(s).map_err(|e| JobError::InvalidHex {
        field,
        reason: e.to_string(),
    })
}

fn hex_array(s: &str, field: &'static str) -> Result<[u8; 32], JobError> {
    let bytes = hex_bytes(s, field)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| JobError::WrongLength {
        field,
        expected: 32,
        actual,
    })
}

/// Stratum sends prevhash with the bytes of each 4-byte word reversed.
fn word_swap(mut hash: [u8; 32]) -> [u8; 32] {
    for word in hash.chunks_exact_mut(4) {
        word.reverse();
    }
    hash
}

/// Stratum sends 32-bit header fields as 8 hex digits, big-endian.
fn hex_u32(s: &str, field: &'static str) -> Result<u32, JobError> {
    let bytes = hex_bytes(s, field)?;
    let array: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| JobError::WrongLength {
            field,
            expected: 4,
            actual: bytes.len(),
        })?;
    Ok(u32::from_be_bytes(array))
}
