// ABOUTME: Voice profile store — enrollment transactions, atomic profile replacement, and verification.
// ABOUTME: Profiles persist to JSON via tmp + rename; verification reads the last committed profile only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::features::{
    AudioSample, EMBEDDING_DIM, SampleRejected, centroid, check_quality, cosine_similarity,
    extract_embedding,
};
use crate::clock::Clock;
use crate::config::{VoiceConfig, write_atomic};

/// Number of samples the enrollment ritual requires.
pub const ENROLLMENT_SAMPLES: usize = 3;

/// Why an enrollment did not produce a profile.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnrollmentFailure {
    #[error("expected exactly 3 samples, got {0}")]
    WrongSampleCount(usize),
    #[error("sample {index} rejected: {reason}")]
    SampleRejected { index: usize, reason: SampleRejected },
    #[error("enrollment was aborted by an earlier rejected sample")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("enrollment failed: {0}")]
    EnrollmentFailed(EnrollmentFailure),
    #[error("verification sample rejected: {0}")]
    SampleRejected(SampleRejected),
    #[error("voice profile for '{owner}' is corrupt: {reason}")]
    CorruptProfile { owner: String, reason: String },
    #[error("voice profile storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// The enrolled reference for one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub owner_id: String,
    /// Embeddings of the enrollment samples, in capture order.
    pub samples: Vec<Vec<f32>>,
    pub centroid: Vec<f32>,
    /// A sample matches iff cosine similarity with the centroid is at least this.
    pub threshold: f32,
    pub enrolled_at: DateTime<Utc>,
}

impl VoiceProfile {
    fn validate(&self) -> Result<(), VoiceError> {
        let corrupt = |reason: &str| VoiceError::CorruptProfile {
            owner: self.owner_id.clone(),
            reason: reason.to_string(),
        };
        if self.samples.len() != ENROLLMENT_SAMPLES {
            return Err(corrupt("wrong number of enrollment samples"));
        }
        if self.centroid.len() != EMBEDDING_DIM
            || self.samples.iter().any(|s| s.len() != EMBEDDING_DIM)
        {
            return Err(corrupt("embedding has the wrong dimension"));
        }
        if self
            .centroid
            .iter()
            .chain(self.samples.iter().flatten())
            .any(|v| !v.is_finite())
        {
            return Err(corrupt("embedding contains non-finite values"));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(corrupt("threshold out of range"));
        }
        Ok(())
    }
}

/// On-disk collection of committed profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfilesFile {
    pub version: u32,
    #[serde(default)]
    pub profiles: Vec<VoiceProfile>,
}

impl Default for VoiceProfilesFile {
    fn default() -> Self {
        Self {
            version: 1,
            profiles: Vec::new(),
        }
    }
}

impl VoiceProfilesFile {
    /// Load profiles from disk. Returns an empty set if the file doesn't exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_atomic(path, &serde_json::to_string_pretty(self)?)
    }
}

/// Result of a single verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyOutcome {
    Matched { similarity: f32 },
    NotMatched { similarity: f32 },
    NoProfile,
}

/// An in-progress enrollment. Nothing is visible to verification until it is committed.
///
/// Dropping or cancelling the session discards every captured sample.
#[derive(Debug)]
pub struct EnrollmentSession {
    owner_id: String,
    embeddings: Vec<Vec<f32>>,
    aborted: bool,
    config: VoiceConfig,
}

impl EnrollmentSession {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn captured(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.aborted && self.embeddings.len() == ENROLLMENT_SAMPLES
    }

    /// Capture the next sample. A rejected sample aborts the whole session.
    ///
    /// Returns how many samples have been captured so far.
    pub fn capture(&mut self, sample: &AudioSample) -> Result<usize, VoiceError> {
        if self.aborted {
            return Err(VoiceError::EnrollmentFailed(EnrollmentFailure::Aborted));
        }
        if self.embeddings.len() >= ENROLLMENT_SAMPLES {
            return Err(VoiceError::EnrollmentFailed(
                EnrollmentFailure::WrongSampleCount(self.embeddings.len() + 1),
            ));
        }
        let index = self.embeddings.len() + 1;
        let embedding = check_quality(sample, &self.config)
            .and_then(|()| extract_embedding(sample))
            .inspect_err(|_| {
                self.embeddings.clear();
                self.aborted = true;
            })
            .map_err(|reason| {
                VoiceError::EnrollmentFailed(EnrollmentFailure::SampleRejected { index, reason })
            })?;
        self.embeddings.push(embedding);
        debug!(owner = %self.owner_id, captured = index, "enrollment sample captured");
        Ok(index)
    }

    /// Abandon the enrollment. Captured samples are discarded.
    pub fn cancel(self) {
        debug!(owner = %self.owner_id, captured = self.embeddings.len(), "enrollment cancelled");
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub struct Committed {
    pub profile: Arc<VoiceProfile>,
    /// Whether an earlier profile for the same owner was replaced.
    pub replaced: bool,
}

/// Holds committed voice profiles and scores verification samples against them.
#[derive(Debug)]
pub struct VoiceBiometricStore {
    profiles: RwLock<HashMap<String, Arc<VoiceProfile>>>,
    /// Serializes commits so persist-then-swap can't interleave.
    commit_lock: Mutex<()>,
    path: Option<PathBuf>,
    config: VoiceConfig,
    clock: Arc<dyn Clock>,
}

impl VoiceBiometricStore {
    pub fn in_memory(config: VoiceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            path: None,
            config,
            clock,
        }
    }

    /// Open the store backed by `path`, validating every stored profile.
    pub fn open(path: &Path, config: VoiceConfig, clock: Arc<dyn Clock>) -> Result<Self, VoiceError> {
        let file = VoiceProfilesFile::load(path)?;
        let mut profiles = HashMap::new();
        for profile in file.profiles {
            profile.validate()?;
            profiles.insert(profile.owner_id.clone(), Arc::new(profile));
        }
        info!(path = %path.display(), count = profiles.len(), "voice profiles loaded");
        Ok(Self {
            profiles: RwLock::new(profiles),
            commit_lock: Mutex::new(()),
            path: Some(path.to_path_buf()),
            config,
            clock,
        })
    }

    pub fn begin_enrollment(&self, owner_id: &str) -> EnrollmentSession {
        EnrollmentSession {
            owner_id: owner_id.to_string(),
            embeddings: Vec::with_capacity(ENROLLMENT_SAMPLES),
            aborted: false,
            config: self.config.clone(),
        }
    }

    /// Turn a complete session into the owner's profile, replacing any previous one atomically.
    ///
    /// The new profile is persisted before it becomes visible; if persisting fails the
    /// previous profile stays in force.
    pub fn commit(&self, session: EnrollmentSession) -> Result<Committed, VoiceError> {
        if session.aborted {
            return Err(VoiceError::EnrollmentFailed(EnrollmentFailure::Aborted));
        }
        if session.embeddings.len() != ENROLLMENT_SAMPLES {
            return Err(VoiceError::EnrollmentFailed(
                EnrollmentFailure::WrongSampleCount(session.embeddings.len()),
            ));
        }

        let profile = Arc::new(VoiceProfile {
            owner_id: session.owner_id.clone(),
            centroid: centroid(&session.embeddings),
            samples: session.embeddings,
            threshold: self.config.threshold(),
            enrolled_at: self.clock.now(),
        });

        let _commit = self.commit_lock.lock().expect("voice commit lock poisoned");
        let mut next = self.profiles.read().expect("voice profiles lock poisoned").clone();
        let replaced = next
            .insert(profile.owner_id.clone(), profile.clone())
            .is_some();

        if let Some(path) = &self.path {
            let mut profiles: Vec<VoiceProfile> =
                next.values().map(|p| p.as_ref().clone()).collect();
            profiles.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
            VoiceProfilesFile {
                version: 1,
                profiles,
            }
            .save(path)?;
        }
        *self.profiles.write().expect("voice profiles lock poisoned") = next;

        info!(owner = %profile.owner_id, replaced, "voice profile committed");
        Ok(Committed { profile, replaced })
    }

    /// Run the whole ritual at once: exactly three samples, all or nothing.
    pub fn enroll(&self, owner_id: &str, samples: &[AudioSample]) -> Result<Committed, VoiceError> {
        if samples.len() != ENROLLMENT_SAMPLES {
            return Err(VoiceError::EnrollmentFailed(
                EnrollmentFailure::WrongSampleCount(samples.len()),
            ));
        }
        let mut session = self.begin_enrollment(owner_id);
        for sample in samples {
            session.capture(sample)?;
        }
        self.commit(session)
    }

    /// Score `sample` against the owner's committed profile. Each call is independent.
    pub fn verify(&self, owner_id: &str, sample: &AudioSample) -> Result<VerifyOutcome, VoiceError> {
        let Some(profile) = self.profile(owner_id) else {
            return Ok(VerifyOutcome::NoProfile);
        };
        check_quality(sample, &self.config).map_err(VoiceError::SampleRejected)?;
        let embedding = extract_embedding(sample).map_err(VoiceError::SampleRejected)?;
        let similarity = cosine_similarity(&embedding, &profile.centroid);
        if similarity >= profile.threshold {
            debug!(owner = owner_id, similarity, "voice matched");
            Ok(VerifyOutcome::Matched { similarity })
        } else {
            debug!(owner = owner_id, similarity, threshold = profile.threshold, "voice did not match");
            Ok(VerifyOutcome::NotMatched { similarity })
        }
    }

    pub fn profile(&self, owner_id: &str) -> Option<Arc<VoiceProfile>> {
        self.profiles
            .read()
            .expect("voice profiles lock poisoned")
            .get(owner_id)
            .cloned()
    }

    pub fn is_enrolled(&self, owner_id: &str) -> bool {
        self.profile(owner_id).is_some()
    }
}
