use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use crate::di::DiTrack;
use crate::error::{Error, Result};
use crate::path::{CompartmentSet, DomainSet};

fn create_writer(path: &str, buffer_size: Option<usize>) -> Result<BufWriter<File>> {
    let file = match buffer_size {
        Some(bfsz) => File::create(path).map(|f| BufWriter::with_capacity(bfsz, f)),
        None => File::create(path).map(BufWriter::new),
    };
    file.map_err(|source| Error::Io {
        source,
        path: Some(path.into()),
    })
}

/// Output files for one segmentation run, named from a shared prefix. Writers
/// are shared behind a mutex so per-chromosome results can be emitted from
/// workers as they finish.
pub struct OutputFiles {
    tad_file: Option<Arc<Mutex<BufWriter<File>>>>,
    compartment_file: Option<Arc<Mutex<BufWriter<File>>>>,
    track_file: Option<Arc<Mutex<BufWriter<File>>>>,
}

impl OutputFiles {
    pub fn for_tads(prefix: &str, buffer_size: Option<usize>) -> Result<Self> {
        Ok(Self {
            tad_file: Some(Arc::new(Mutex::new(create_writer(
                &format!("{prefix}.tads.txt"),
                buffer_size,
            )?))),
            compartment_file: None,
            track_file: None,
        })
    }

    /// TAD output plus the directionality score track.
    pub fn for_di(prefix: &str, buffer_size: Option<usize>) -> Result<Self> {
        Ok(Self {
            tad_file: Some(Arc::new(Mutex::new(create_writer(
                &format!("{prefix}.tads.txt"),
                buffer_size,
            )?))),
            compartment_file: None,
            track_file: Some(Arc::new(Mutex::new(create_writer(
                &format!("{prefix}.di.txt"),
                buffer_size,
            )?))),
        })
    }

    pub fn for_compartments(prefix: &str, buffer_size: Option<usize>) -> Result<Self> {
        Ok(Self {
            tad_file: None,
            compartment_file: Some(Arc::new(Mutex::new(create_writer(
                &format!("{prefix}.compartments.txt"),
                buffer_size,
            )?))),
            track_file: None,
        })
    }

    /// `chrom\tstart\tstop` rows, chromosomes in sorted order, intervals
    /// ascending by start.
    pub fn write_tads(&self, sets: &[DomainSet]) -> Result<()> {
        let file = self
            .tad_file
            .as_ref()
            .ok_or_else(|| Error::config("no TAD output file was opened"))?;
        let mut sorted: Vec<&DomainSet> = sets.iter().collect();
        sorted.sort_by(|a, b| a.chrom.cmp(&b.chrom));
        let mut w = file
            .lock()
            .map_err(|_| Error::WorkerComm("tad writer lock poisoned".into()))?;
        for set in sorted {
            for iv in &set.intervals {
                writeln!(w, "{}\t{}\t{}", set.chrom, iv.start, iv.stop).map_err(|source| {
                    Error::Io {
                        source,
                        path: None,
                    }
                })?;
            }
        }
        w.flush().map_err(|source| Error::Io { source, path: None })
    }

    /// `chrom\tstart\tstop\tlabel` rows.
    pub fn write_compartments(&self, sets: &[CompartmentSet]) -> Result<()> {
        let file = self
            .compartment_file
            .as_ref()
            .ok_or_else(|| Error::config("no compartment output file was opened"))?;
        let mut sorted: Vec<&CompartmentSet> = sets.iter().collect();
        sorted.sort_by(|a, b| a.chrom.cmp(&b.chrom));
        let mut w = file
            .lock()
            .map_err(|_| Error::WorkerComm("compartment writer lock poisoned".into()))?;
        for set in sorted {
            for iv in &set.intervals {
                writeln!(w, "{}\t{}\t{}\t{}", set.chrom, iv.start, iv.stop, iv.state).map_err(
                    |source| Error::Io {
                        source,
                        path: None,
                    },
                )?;
            }
        }
        w.flush().map_err(|source| Error::Io { source, path: None })
    }

    /// `chrom\tposition\tscore` rows for external plotting.
    pub fn write_di_tracks(&self, tracks: &[DiTrack]) -> Result<()> {
        let file = self
            .track_file
            .as_ref()
            .ok_or_else(|| Error::config("no score-track output file was opened"))?;
        let mut sorted: Vec<&DiTrack> = tracks.iter().collect();
        sorted.sort_by(|a, b| a.chrom.cmp(&b.chrom));
        let mut w = file
            .lock()
            .map_err(|_| Error::WorkerComm("track writer lock poisoned".into()))?;
        for track in sorted {
            for &(position, score) in &track.points {
                writeln!(w, "{}\t{}\t{:.6}", track.chrom, position, score).map_err(|source| {
                    Error::Io {
                        source,
                        path: None,
                    }
                })?;
            }
        }
        w.flush().map_err(|source| Error::Io { source, path: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{CompartmentInterval, DomainInterval};

    fn temp_prefix(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("hicseg-output-{tag}-{}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn tads_are_written_in_chromosome_order() {
        let prefix = temp_prefix("tads");
        let out = OutputFiles::for_tads(&prefix, Some(1 << 16)).unwrap();
        let sets = vec![
            DomainSet {
                chrom: "chr2".into(),
                intervals: vec![DomainInterval {
                    start: 0,
                    stop: 50_000,
                }],
            },
            DomainSet {
                chrom: "chr1".into(),
                intervals: vec![
                    DomainInterval {
                        start: 10_000,
                        stop: 90_000,
                    },
                    DomainInterval {
                        start: 100_000,
                        stop: 150_000,
                    },
                ],
            },
        ];
        out.write_tads(&sets).unwrap();
        let path = format!("{prefix}.tads.txt");
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "chr1\t10000\t90000\nchr1\t100000\t150000\nchr2\t0\t50000\n"
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn compartment_rows_carry_labels() {
        let prefix = temp_prefix("comp");
        let out = OutputFiles::for_compartments(&prefix, None).unwrap();
        let sets = vec![CompartmentSet {
            chrom: "chr1".into(),
            intervals: vec![
                CompartmentInterval {
                    start: 0,
                    stop: 40_000,
                    state: 0,
                    mean_score: 0.7,
                },
                CompartmentInterval {
                    start: 40_000,
                    stop: 80_000,
                    state: 1,
                    mean_score: -0.5,
                },
            ],
        }];
        out.write_compartments(&sets).unwrap();
        let path = format!("{prefix}.compartments.txt");
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "chr1\t0\t40000\t0\nchr1\t40000\t80000\t1\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn poisoned_writer_lock_is_a_worker_error() {
        let prefix = temp_prefix("poison");
        let out = OutputFiles::for_tads(&prefix, None).unwrap();
        let file = out.tad_file.as_ref().unwrap().clone();
        let _ = std::thread::spawn(move || {
            let _guard = file.lock().unwrap();
            panic!("poison the writer lock");
        })
        .join();
        assert!(matches!(out.write_tads(&[]), Err(Error::WorkerComm(_))));
        let _ = std::fs::remove_file(format!("{prefix}.tads.txt"));
    }

    #[test]
    fn writing_without_an_open_file_is_a_config_error() {
        let prefix = temp_prefix("mismatch");
        let out = OutputFiles::for_tads(&prefix, None).unwrap();
        assert!(matches!(
            out.write_compartments(&[]),
            Err(Error::Config(_))
        ));
        let _ = std::fs::remove_file(format!("{prefix}.tads.txt"));
    }
}
