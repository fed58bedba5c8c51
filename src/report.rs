//! Human and machine readable views of a replay.

use serde::Serialize;
use std::io::{self, Write};

use crate::eventlog::LogEntry;
use crate::predict::{Decision, ReplayState, SkipReason, Source};
use crate::tpm::PcrReader;
use crate::{serialize_as_hex, to_hex, Digest, Error, PCR_SIZE};

const NOT_SHOWN: &str = "(none)";

fn write_header<W: Write>(out: &mut W, left: &str, right: &str) -> io::Result<()> {
    writeln!(
        out,
        "{:7} {:<width$} | {:<width$}",
        "",
        left,
        right,
        width = PCR_SIZE * 2
    )
}

/// Describes one log entry and what the replay did with it.
pub fn write_trace<W: Write>(
    out: &mut W,
    entry: &LogEntry,
    decision: &Decision,
    state: &ReplayState,
) -> io::Result<()> {
    writeln!(
        out,
        "PCR {} {:?}: {} bytes of event data, extend value {}",
        entry.pcr_index as i32,
        entry.event,
        entry.data.len(),
        entry
            .sha1
            .as_ref()
            .map(|d| to_hex(d))
            .unwrap_or_else(|| NOT_SHOWN.to_string())
    )?;

    match decision {
        Decision::Skip(SkipReason::NoSha1) => {
            writeln!(out, "event does not update SHA1 PCR bank, skipping")?;
            return writeln!(out);
        }
        Decision::Skip(SkipReason::VirtualPcr) => {
            writeln!(out, "event updates Windows virtual PCR[-1], skipping")?;
            return writeln!(out);
        }
        Decision::Skip(SkipReason::NoAction) => {}
        Decision::Unmapped(reason) => {
            writeln!(out, "{}", reason)?;
            writeln!(out, "entry didn't map to a Linux path")?;
            return writeln!(out);
        }
        Decision::Fold {
            this_value,
            next_value,
            source,
        } => match source {
            Source::Logged => {}
            Source::Image { path, file_hash } => {
                writeln!(out, "-- extending with coff hash --")?;
                writeln!(out, "file path = {}", path.display())?;
                writeln!(out, "file hash = {}", to_hex(file_hash))?;
                writeln!(out, "this event extend value = {}", to_hex(this_value))?;
                writeln!(out, "guessed extend value = {}", to_hex(next_value))?;
            }
            Source::LoaderCmdline {
                this_cmdline,
                next_cmdline,
            } => {
                writeln!(out, "-- extending with systemd-boot cmdline --")?;
                writeln!(
                    out,
                    "this cmdline: {}",
                    this_cmdline.as_deref().unwrap_or(NOT_SHOWN)
                )?;
                writeln!(out, "next cmdline: {}", next_cmdline)?;
            }
            Source::UnknownLoader => {
                writeln!(out, "-- not touching non-systemd IPL event --")?;
            }
        },
    }

    if let (Ok(current), Ok(predicted)) = (
        state.current.get(entry.pcr_index),
        state.predicted.get(entry.pcr_index),
    ) {
        writeln!(
            out,
            "--> after this event, PCR {} contains value {}",
            entry.pcr_index,
            to_hex(current)
        )?;
        writeln!(
            out,
            "--> after reboot, PCR {} will contain value {}",
            entry.pcr_index,
            to_hex(predicted)
        )?;
    }
    writeln!(out)
}

pub fn write_final_table<W: Write>(
    out: &mut W,
    state: &ReplayState,
    pcrs: &[u32],
) -> Result<(), Error> {
    writeln!(out, "== Final computed & predicted PCR values ==")?;
    write_header(out, "CURRENT", "PREDICTED NEXT")?;
    for &pcr in pcrs {
        writeln!(
            out,
            "PCR {:2}: {} | {}",
            pcr,
            to_hex(state.current.get(pcr)?),
            to_hex(state.predicted.get(pcr)?)
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparedPcr {
    pub index: u32,
    pub real: Digest,
    pub computed: Digest,
}

impl ComparedPcr {
    pub fn matches(&self) -> bool {
        self.real == self.computed
    }
}

/// The replayed current bank held against the live TPM.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub pcrs: Vec<ComparedPcr>,
}

impl Comparison {
    pub fn mismatches(&self) -> usize {
        self.pcrs.iter().filter(|p| !p.matches()).count()
    }

    pub fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "== Real vs computed PCR values ==")?;
        write_header(out, "REAL", "COMPUTED")?;
        for pcr in &self.pcrs {
            writeln!(
                out,
                "PCR {:2}: {} | {} {}",
                pcr.index,
                to_hex(&pcr.real),
                to_hex(&pcr.computed),
                if pcr.matches() { "+" } else { "<BAD>" }
            )?;
        }
        Ok(())
    }
}

pub fn compare(
    state: &ReplayState,
    pcrs: &[u32],
    reader: &dyn PcrReader,
) -> Result<Comparison, Error> {
    let pcrs = pcrs
        .iter()
        .map(|&index| {
            Ok(ComparedPcr {
                index,
                real: reader.read_pcr(index)?,
                computed: *state.current.get(index)?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(Comparison { pcrs })
}

/// Writes the raw predicted digests, back to back, in the order given.
pub fn write_predicted<W: Write>(
    out: &mut W,
    state: &ReplayState,
    pcrs: &[u32],
) -> Result<(), Error> {
    for &pcr in pcrs {
        out.write_all(state.predicted.get(pcr)?)?;
    }
    out.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct PcrValues {
    pub index: u32,
    #[serde(serialize_with = "serialize_as_hex")]
    pub current: Digest,
    #[serde(serialize_with = "serialize_as_hex")]
    pub predicted: Digest,
}

#[derive(Debug, Serialize)]
pub struct Results {
    pub pcrs: Vec<PcrValues>,
    pub errors: u32,
}

impl Results {
    pub fn new(state: &ReplayState, pcrs: &[u32]) -> Result<Results, Error> {
        let pcrs = pcrs
            .iter()
            .map(|&index| {
                Ok(PcrValues {
                    index,
                    current: *state.current.get(index)?,
                    predicted: *state.predicted.get(index)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Results {
            pcrs,
            errors: state.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::{EventType, TcgEvent};
    use std::path::PathBuf;

    struct Live(Vec<Digest>);

    impl PcrReader for Live {
        fn read_pcr(&self, index: u32) -> Result<Digest, Error> {
            self.0
                .get(index as usize)
                .copied()
                .ok_or_else(|| Error::LivePcr(index, "missing".to_string()))
        }
    }

    fn replayed() -> ReplayState {
        let mut state = ReplayState::new();
        state.current.extend(4, &[0x11; 20]).unwrap();
        state.predicted.extend(4, &[0x22; 20]).unwrap();
        state
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn final_table() {
        let state = replayed();
        let mut out = Vec::new();
        write_final_table(&mut out, &state, &[0, 4]).unwrap();
        let out = text(out);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "== Final computed & predicted PCR values ==");
        assert!(lines[1].trim_start().starts_with("CURRENT"));
        assert_eq!(
            lines[2],
            format!("PCR  0: {} | {}", "00".repeat(20), "00".repeat(20))
        );
        assert_eq!(
            lines[3],
            format!(
                "PCR  4: {} | {}",
                to_hex(state.current.get(4).unwrap()),
                to_hex(state.predicted.get(4).unwrap())
            )
        );
    }

    #[test]
    fn comparison() {
        let state = replayed();
        let mut live = vec![[0; 20]; 24];
        live[4] = *state.current.get(4).unwrap();

        let cmp = compare(&state, &[0, 4, 7], &Live(live.clone())).unwrap();
        assert_eq!(cmp.mismatches(), 0);

        live[7] = [0x55; 20];
        let cmp = compare(&state, &[0, 4, 7], &Live(live)).unwrap();
        assert_eq!(cmp.mismatches(), 1);

        let mut out = Vec::new();
        cmp.write(&mut out).unwrap();
        let out = text(out);
        assert!(out.starts_with("== Real vs computed PCR values ==\n"));
        assert!(out.contains(&format!(
            "PCR  4: {0} | {0} +",
            to_hex(state.current.get(4).unwrap())
        )));
        assert!(out.lines().last().unwrap().ends_with("<BAD>"));
    }

    #[test]
    fn comparison_ignores_prediction() {
        // Only the current bank is held against the TPM
        let state = replayed();
        let mut live = vec![[0; 20]; 24];
        live[4] = *state.predicted.get(4).unwrap();
        let cmp = compare(&state, &[4], &Live(live)).unwrap();
        assert_eq!(cmp.mismatches(), 1);
    }

    #[test]
    fn predicted_output() {
        let state = replayed();
        let mut out = Vec::new();
        write_predicted(&mut out, &state, &[0, 4]).unwrap();
        assert_eq!(out.len(), 40);
        assert_eq!(&out[..20], &[0; 20]);
        assert_eq!(&out[20..], state.predicted.get(4).unwrap());

        assert!(matches!(
            write_predicted(&mut Vec::new(), &state, &[24]),
            Err(Error::PcrIndexOutOfRange(24))
        ));
    }

    #[test]
    fn yaml_results() {
        let state = replayed();
        let results = Results::new(&state, &[4]).unwrap();
        let yaml = serde_yaml::to_string(&results).unwrap();
        assert!(yaml.contains(&format!("current: {}", to_hex(state.current.get(4).unwrap()))));
        assert!(yaml.contains("errors: 0"));
    }

    #[test]
    fn trace_for_boot_application() {
        let mut state = ReplayState::new();
        state.current.extend(4, &[0x11; 20]).unwrap();
        state.predicted.extend(4, &[0x22; 20]).unwrap();
        let entry = LogEntry {
            pcr_index: 4,
            event: EventType::Known(TcgEvent::EfiBootServicesApplication),
            data: vec![0; 8],
            sha1: Some([0x11; 20]),
        };
        let decision = Decision::Fold {
            this_value: [0x11; 20],
            next_value: [0x22; 20],
            source: Source::Image {
                path: PathBuf::from("/boot/efi/EFI/Linux/linux.efi"),
                file_hash: [0x22; 20],
            },
        };

        let mut out = Vec::new();
        write_trace(&mut out, &entry, &decision, &state).unwrap();
        let out = text(out);
        assert!(out.contains("-- extending with coff hash --"));
        assert!(out.contains("file path = /boot/efi/EFI/Linux/linux.efi"));
        assert!(out.contains(&format!("guessed extend value = {}", "22".repeat(20))));
        assert!(out.contains(&format!(
            "--> after reboot, PCR 4 will contain value {}",
            to_hex(state.predicted.get(4).unwrap())
        )));
    }

    #[test]
    fn trace_for_virtual_pcr() {
        let entry = LogEntry {
            pcr_index: crate::VIRTUAL_PCR,
            event: EventType::Unknown(0x800),
            data: Vec::new(),
            sha1: Some([0; 20]),
        };
        let mut out = Vec::new();
        write_trace(
            &mut out,
            &entry,
            &Decision::Skip(SkipReason::VirtualPcr),
            &ReplayState::new(),
        )
        .unwrap();
        let out = text(out);
        assert!(out.starts_with("PCR -1 "));
        assert!(out.contains("virtual PCR[-1], skipping"));
        assert!(!out.contains("-->"));
    }
}
