//! Replay of the event log into the current and predicted PCR banks.
//!
//! Each entry is first classified against the replay state, which decides the
//! value folded into each bank, and the decision is then applied. Only
//! EFI boot applications and loader IPL events can make the banks diverge.

use fallible_iterator::FallibleIterator;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};

use crate::devpath::{DevicePathResolver, ResolveError};
use crate::eventlog::{EventKind, LogEntry};
use crate::parsed::decode_loader_cmdline;
use crate::pcr::PcrBank;
use crate::pecoff::hash_pecoff;
use crate::systemd_boot::{loader_encode_pcr8, LoaderError, LoaderPredictor};
use crate::tpm::PcrReader;
use crate::{hash_bytes, to_hex, Digest, Error, NUM_PCRS, VIRTUAL_PCR};

/// What to do when a boot application cannot be mapped to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Give up: the prediction would rest on an unknown component.
    Strict,
    /// Count the problem, leave the entry out of both banks and carry on.
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct Settings {
    policy: Policy,
    wanted: Option<Vec<u32>>,
    live_fallback: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    pub fn new() -> Self {
        Settings {
            policy: Policy::Strict,
            wanted: None,
            live_fallback: None,
        }
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    /// Limits reporting and command line prediction to these PCRs.
    pub fn set_wanted(&mut self, mut wanted: Vec<u32>) {
        wanted.sort_unstable();
        wanted.dedup();
        self.wanted = Some(wanted);
    }

    /// After the replay, a PCR no entry was folded into takes its live value
    /// in both banks. Some loaders extend PCR 8 without logging it.
    pub fn set_live_fallback(&mut self, pcr: Option<u32>) {
        self.live_fallback = pcr;
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn live_fallback(&self) -> Option<u32> {
        self.live_fallback
    }

    pub fn is_wanted(&self, pcr: u32) -> bool {
        match &self.wanted {
            Some(wanted) => wanted.contains(&pcr),
            None => true,
        }
    }

    /// Requested PCRs in ascending order.
    pub fn wanted_pcrs(&self) -> Vec<u32> {
        match &self.wanted {
            Some(wanted) => wanted.clone(),
            None => (0..NUM_PCRS as u32).collect(),
        }
    }
}

/// The parts of the running system the prediction looks at.
pub trait BootEnvironment {
    fn resolve_boot_application(&self, event_data: &[u8]) -> Result<PathBuf, ResolveError>;
    fn hash_image(&self, path: &Path) -> Result<Digest, Error>;
    fn next_cmdline(&self, last_efi_binary: Option<&Path>) -> Result<String, LoaderError>;
}

#[derive(Default)]
pub struct SystemEnvironment {
    pub devices: DevicePathResolver,
    pub loader: LoaderPredictor,
}

impl BootEnvironment for SystemEnvironment {
    fn resolve_boot_application(&self, event_data: &[u8]) -> Result<PathBuf, ResolveError> {
        self.devices.resolve(event_data)
    }

    fn hash_image(&self, path: &Path) -> Result<Digest, Error> {
        hash_pecoff(path)
    }

    fn next_cmdline(&self, last_efi_binary: Option<&Path>) -> Result<String, LoaderError> {
        self.loader.next_cmdline(last_efi_binary)
    }
}

/// Everything the replay carries from one entry to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
    pub current: PcrBank,
    pub predicted: PcrBank,
    /// Most recent boot application that mapped to a file.
    pub last_efi_binary: Option<PathBuf>,
    /// Boot applications that could not be mapped.
    pub errors: u32,
    folded: [bool; NUM_PCRS],
}

impl Default for ReplayState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayState {
    pub fn new() -> Self {
        ReplayState {
            current: PcrBank::new(),
            predicted: PcrBank::new(),
            last_efi_binary: None,
            errors: 0,
            folded: [false; NUM_PCRS],
        }
    }

    /// Whether any entry has been folded into `pcr`.
    pub fn is_folded(&self, pcr: u32) -> bool {
        self.folded.get(pcr as usize).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The entry did not extend the SHA-1 bank.
    NoSha1,
    /// Windows' virtual PCR[-1].
    VirtualPcr,
    /// Informational; never extended.
    NoAction,
}

/// Why the predicted value is what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Same as logged.
    Logged,
    /// The boot application currently on disk.
    Image { path: PathBuf, file_hash: Digest },
    /// The command line systemd-boot will pass next time.
    LoaderCmdline {
        this_cmdline: Option<String>,
        next_cmdline: String,
    },
    /// IPL event outside a recognizable systemd-boot setup.
    UnknownLoader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    /// A boot application that did not map to a file (best-effort only).
    Unmapped(String),
    Fold {
        this_value: Digest,
        next_value: Digest,
        source: Source,
    },
}

pub struct Predictor<E: BootEnvironment> {
    settings: Settings,
    env: E,
}

impl<E: BootEnvironment> Predictor<E> {
    pub fn new(settings: Settings, env: E) -> Self {
        Predictor { settings, env }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Decides what `entry` contributes to each bank. Does not touch `state`.
    pub fn classify(&self, state: &ReplayState, entry: &LogEntry) -> Result<Decision, Error> {
        let this_value = match entry.sha1 {
            Some(value) => value,
            None => return Ok(Decision::Skip(SkipReason::NoSha1)),
        };
        if entry.pcr_index == VIRTUAL_PCR {
            return Ok(Decision::Skip(SkipReason::VirtualPcr));
        }

        match entry.kind() {
            EventKind::NoAction => Ok(Decision::Skip(SkipReason::NoAction)),
            EventKind::BootServicesApplication => {
                match self.env.resolve_boot_application(&entry.data) {
                    Ok(path) => {
                        let file_hash = self.env.hash_image(&path)?;
                        Ok(Decision::Fold {
                            this_value,
                            next_value: file_hash,
                            source: Source::Image { path, file_hash },
                        })
                    }
                    Err(reason) => match self.settings.policy {
                        Policy::BestEffort => Ok(Decision::Unmapped(reason.to_string())),
                        Policy::Strict => {
                            error!(
                                "PCR {} {:?}: boot application did not map to a file: {}",
                                entry.pcr_index, entry.event, reason
                            );
                            Err(Error::UnmappedBootApplication {
                                pcr_index: entry.pcr_index,
                                event: entry.event,
                                reason,
                            })
                        }
                    },
                }
            }
            EventKind::Ipl if self.settings.is_wanted(entry.pcr_index) => {
                match self.env.next_cmdline(state.last_efi_binary.as_deref()) {
                    Ok(next_cmdline) => Ok(Decision::Fold {
                        this_value,
                        next_value: hash_bytes(&loader_encode_pcr8(&next_cmdline)),
                        source: Source::LoaderCmdline {
                            this_cmdline: decode_loader_cmdline(&entry.data),
                            next_cmdline,
                        },
                    }),
                    Err(LoaderError::NotRecognized(why)) => {
                        debug!("Leaving IPL event on PCR {} as is: {}", entry.pcr_index, why);
                        Ok(Decision::Fold {
                            this_value,
                            next_value: this_value,
                            source: Source::UnknownLoader,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(Decision::Fold {
                this_value,
                next_value: this_value,
                source: Source::Logged,
            }),
        }
    }

    /// Applies a decision made by `classify` for the same entry.
    pub fn apply(
        &self,
        state: &mut ReplayState,
        entry: &LogEntry,
        decision: &Decision,
    ) -> Result<(), Error> {
        match decision {
            Decision::Skip(_) => {}
            Decision::Unmapped(reason) => {
                warn!(
                    "PCR {} {:?}: entry didn't map to a file, leaving it out: {}",
                    entry.pcr_index, entry.event, reason
                );
                state.errors += 1;
            }
            Decision::Fold {
                this_value,
                next_value,
                source,
            } => {
                if let Source::Image { path, .. } = source {
                    state.last_efi_binary = Some(path.clone());
                }
                state.current.extend(entry.pcr_index, this_value)?;
                state.predicted.extend(entry.pcr_index, next_value)?;
                state.folded[entry.pcr_index as usize] = true;
            }
        }
        Ok(())
    }

    pub fn process(&self, state: &mut ReplayState, entry: &LogEntry) -> Result<Decision, Error> {
        let decision = self.classify(state, entry)?;
        self.apply(state, entry, &decision)?;
        Ok(decision)
    }

    /// Replays the whole log, calling `observe` after each entry.
    pub fn replay<I, F>(&self, mut entries: I, mut observe: F) -> Result<ReplayState, Error>
    where
        I: FallibleIterator<Item = LogEntry, Error = Error>,
        F: FnMut(&LogEntry, &Decision, &ReplayState) -> Result<(), Error>,
    {
        let mut state = ReplayState::new();
        let mut count = 0usize;
        while let Some(entry) = entries.next()? {
            let decision = self.process(&mut state, &entry)?;
            observe(&entry, &decision, &state)?;
            count += 1;
        }
        info!(
            "Replayed {} log entries, {} boot applications unmapped",
            count, state.errors
        );
        Ok(state)
    }

    /// Patches the configured fallback PCR with its live value if the log
    /// never touched it.
    pub fn apply_live_fallback(
        &self,
        state: &mut ReplayState,
        reader: &dyn PcrReader,
    ) -> Result<(), Error> {
        let pcr = match self.settings.live_fallback {
            Some(pcr) => pcr,
            None => return Ok(()),
        };
        if state.is_folded(pcr) {
            return Ok(());
        }
        let live = reader.read_pcr(pcr)?;
        info!("PCR {} has no log entries, assuming live value {}", pcr, to_hex(&live));
        state.current.assume(pcr, live)?;
        state.predicted.assume(pcr, live)?;
        Ok(())
    }
}
