//! Sector-by-sector tag authentication and reading
//!
//! One scan session walks all 16 sectors in order: authenticate with the
//! derived keys, then read the sector's three data blocks. Sectors that
//! refuse every key are recorded as failed and their blocks stay absent;
//! a partial result with at least one authenticated sector is a normal,
//! usable outcome.

use crate::dump::{BLOCKS_PER_SECTOR, BLOCK_SIZE, DATA_BLOCKS_PER_SECTOR};
use crate::keys::{self, SectorKeys, SECTOR_COUNT};
use crate::transport::{ConnectionGuard, TagTransport};
use crate::uid::TagUid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Alternate key indices tried after a sector's own key is rejected.
/// Bounded rotation: own index, then (index+1) % 16, then (index+5) % 16.
const KEY_ROTATION_OFFSETS: [usize; 2] = [1, 5];

/// Session phase, advanced strictly in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    Connecting,
    Authenticating(usize),
    Reading(usize),
    Assembling,
    Done,
    Failed,
}

/// Progress update emitted between protocol steps
///
/// Purely informational; correctness never depends on observer behavior.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub percent: u8,
    pub current_sector: Option<usize>,
    pub status: String,
}

/// Callback receiving progress updates during a scan session
pub type ProgressObserver = Box<dyn Fn(ScanProgress) + Send + Sync>;

/// Result of one authentication session
///
/// Always returned, never thrown: a session that authenticates no sector at
/// all still produces an outcome with `succeeded() == false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationOutcome {
    pub uid_hex: String,
    pub authenticated_sectors: Vec<usize>,
    pub failed_sectors: Vec<usize>,
    /// sector -> derived-key index that authenticated it
    pub key_used: BTreeMap<usize, usize>,
    /// Absolute block index -> block bytes, data blocks of authenticated
    /// sectors only. Failed sectors leave their blocks absent.
    pub blocks: BTreeMap<usize, [u8; BLOCK_SIZE]>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl AuthenticationOutcome {
    /// Overall success: at least one sector authenticated
    pub fn succeeded(&self) -> bool {
        !self.authenticated_sectors.is_empty()
    }
}

/// Cooperative cancellation handle, checked between sector operations
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sequential per-sector authenticate+read state machine
pub struct TagAuthenticator<'a> {
    transport: &'a dyn TagTransport,
    observer: Option<ProgressObserver>,
    cancellation: CancellationToken,
}

impl<'a> TagAuthenticator<'a> {
    pub fn new(transport: &'a dyn TagTransport) -> Self {
        Self {
            transport,
            observer: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach a progress observer
    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attach an external cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Run a full session against the tag in the field.
    ///
    /// The transport connection is scoped to this call and released on every
    /// exit path. Transport-level errors (as opposed to key rejections)
    /// abort the remaining sectors but still return the partial outcome.
    pub fn authenticate_tag(&self, uid: &TagUid) -> AuthenticationOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut outcome = AuthenticationOutcome {
            uid_hex: uid.canonical(),
            authenticated_sectors: Vec::new(),
            failed_sectors: Vec::new(),
            key_used: BTreeMap::new(),
            blocks: BTreeMap::new(),
            started_at,
            duration_ms: 0,
            cancelled: false,
        };

        let sector_keys = keys::derive_sector_keys(uid);
        if sector_keys.is_empty() {
            // Underivable UID: every sector fails, nothing read
            self.emit(AuthPhase::Failed, None, "No keys derivable for UID");
            outcome.failed_sectors = (0..SECTOR_COUNT).collect();
            outcome.duration_ms = timer.elapsed().as_millis() as u64;
            return outcome;
        }

        self.emit(AuthPhase::Connecting, None, "Connecting to tag");
        let guard = match ConnectionGuard::open(self.transport) {
            Ok(g) => g,
            Err(_) => {
                self.emit(AuthPhase::Failed, None, "Connection failed");
                outcome.failed_sectors = (0..SECTOR_COUNT).collect();
                outcome.duration_ms = timer.elapsed().as_millis() as u64;
                return outcome;
            }
        };

        for sector in 0..SECTOR_COUNT {
            if self.cancellation.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            self.emit(
                AuthPhase::Authenticating(sector),
                Some(sector),
                &format!("Authenticating sector {}", sector),
            );

            match self.authenticate_sector(sector, &sector_keys) {
                SectorAuth::Ok(key_index) => {
                    outcome.key_used.insert(sector, key_index);
                    self.emit(
                        AuthPhase::Reading(sector),
                        Some(sector),
                        &format!("Reading sector {}", sector),
                    );
                    self.read_sector(sector, &mut outcome.blocks);
                    outcome.authenticated_sectors.push(sector);
                }
                SectorAuth::Rejected => {
                    outcome.failed_sectors.push(sector);
                }
                SectorAuth::TransportError => {
                    // Remaining sectors are unreachable on a dead transport
                    outcome.failed_sectors.extend(sector..SECTOR_COUNT);
                    break;
                }
            }
        }

        drop(guard);

        self.emit(AuthPhase::Assembling, None, "Assembling result");
        outcome.duration_ms = timer.elapsed().as_millis() as u64;

        if outcome.succeeded() {
            self.emit(AuthPhase::Done, None, "Done");
        } else {
            self.emit(AuthPhase::Failed, None, "No sector authenticated");
        }
        outcome
    }

    /// Try the sector's own key, then two rotated alternates
    fn authenticate_sector(&self, sector: usize, sector_keys: &SectorKeys) -> SectorAuth {
        let mut candidates = Vec::with_capacity(1 + KEY_ROTATION_OFFSETS.len());
        candidates.push(sector);
        for offset in KEY_ROTATION_OFFSETS {
            candidates.push((sector + offset) % SECTOR_COUNT);
        }

        for key_index in candidates {
            match self.transport.authenticate(sector, &sector_keys[key_index]) {
                Ok(true) => return SectorAuth::Ok(key_index),
                Ok(false) => continue,
                Err(_) => return SectorAuth::TransportError,
            }
        }
        SectorAuth::Rejected
    }

    /// Read the three data blocks of an authenticated sector.
    /// Unreadable blocks within an authenticated sector stay absent.
    fn read_sector(&self, sector: usize, blocks: &mut BTreeMap<usize, [u8; BLOCK_SIZE]>) {
        for data_index in 0..DATA_BLOCKS_PER_SECTOR {
            let block = sector * BLOCKS_PER_SECTOR + data_index;
            if let Ok(Some(data)) = self.transport.read_block(block) {
                blocks.insert(block, data);
            }
        }
    }

    fn emit(&self, phase: AuthPhase, sector: Option<usize>, status: &str) {
        if let Some(observer) = &self.observer {
            let percent = match phase {
                AuthPhase::Idle => 0,
                AuthPhase::Connecting => 2,
                AuthPhase::Authenticating(s) | AuthPhase::Reading(s) => {
                    (5 + (s * 90) / SECTOR_COUNT) as u8
                }
                AuthPhase::Assembling => 97,
                AuthPhase::Done | AuthPhase::Failed => 100,
            };
            observer(ScanProgress {
                percent,
                current_sector: sector,
                status: status.to_string(),
            });
        }
    }
}

enum SectorAuth {
    Ok(usize),
    Rejected,
    TransportError,
}
