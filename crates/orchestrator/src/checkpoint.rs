//! JSON-lines particle checkpoints.
//!
//! A checkpoint file holds one header record followed by one record per
//! particle, each on its own line. Two layouts are supported:
//!
//! - per-rank files, named from a pattern with `{name}`, `{nproc}` and
//!   `{rank}` placeholders, each written and read by its own rank;
//! - a single file, written by rank 0 after gathering every particle, and
//!   read by rank 0, which keeps its share and sends the other ranks theirs.
//!
//! Reads reserve four times the loaded count so the next exchanges have
//! room to grow.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use particle_kernel::Particle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CheckpointConfig;
use crate::error::{Error, Result, TransportError};
use crate::system::ParticleSystem;
use crate::transport::{Completion, ReduceOp, Transport};

/// Point-to-point tag of the per-rank particle counts of a single-file read.
const COUNT_TAG: u32 = u32::MAX;
/// Point-to-point tag of particle payloads in single-file reads and writes.
const DATA_TAG: u32 = u32::MAX - 1;

/// First record of a checkpoint file.
pub trait CheckpointHeader: Serialize + DeserializeOwned {
    /// Number of particle records that follow, if the header knows it.
    ///
    /// When `None` the reader counts the remaining records instead.
    fn particle_count(&self) -> Option<usize> {
        None
    }
}

/// Header carrying nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmptyHeader {}

impl CheckpointHeader for EmptyHeader {}

/// Header recording the run name, group size and particle count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountedHeader {
    /// Run name.
    pub name: String,
    /// Group size at write time.
    pub nproc: usize,
    /// Particle records in this file.
    pub count: usize,
    /// Simulation time, if the driver tracks one.
    #[serde(default)]
    pub time: f64,
}

impl CheckpointHeader for CountedHeader {
    fn particle_count(&self) -> Option<usize> {
        Some(self.count)
    }
}

/// Where checkpoint files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    /// File name pattern.
    pub pattern: String,
    /// Substituted for `{name}`.
    pub name: String,
    /// One file for the whole group instead of one per rank.
    pub single_file: bool,
}

impl FileLayout {
    /// One shared file at `path`.
    pub fn single(path: impl Into<String>) -> Self {
        Self {
            pattern: path.into(),
            name: String::new(),
            single_file: true,
        }
    }

    /// One file per rank named from `pattern`.
    pub fn per_rank(pattern: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            name: name.into(),
            single_file: false,
        }
    }

    /// Layout described by a run configuration.
    pub fn from_config(config: &CheckpointConfig, name: &str) -> Self {
        Self {
            pattern: config.pattern.clone(),
            name: name.to_string(),
            single_file: config.single_file,
        }
    }

    /// File used by `rank` of a group of `nproc`.
    pub fn path_for(&self, nproc: usize, rank: usize) -> PathBuf {
        PathBuf::from(rank_file_name(&self.pattern, &self.name, nproc, rank))
    }
}

/// Expand `{name}`, `{nproc}` and `{rank}` in `pattern`.
pub fn rank_file_name(pattern: &str, name: &str, nproc: usize, rank: usize) -> String {
    pattern
        .replace("{name}", name)
        .replace("{nproc}", &nproc.to_string())
        .replace("{rank}", &rank.to_string())
}

fn write_records<'a, H, P, I>(path: &Path, header: &H, particles: I) -> Result<()>
where
    H: Serialize,
    P: Serialize + 'a,
    I: IntoIterator<Item = &'a P>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut out, header)?;
    out.write_all(b"\n")?;
    for p in particles {
        serde_json::to_writer(&mut out, p)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn read_records<H, P>(path: &Path) -> Result<(H, Vec<P>)>
where
    H: CheckpointHeader,
    P: DeserializeOwned,
{
    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
    let header: H = match lines.next() {
        Some(line) => serde_json::from_str(line)?,
        None => {
            return Err(Error::Checkpoint(format!(
                "{} has no header record",
                path.display()
            )))
        }
    };
    let records = match header.particle_count() {
        Some(count) => {
            let records = lines
                .take(count)
                .map(serde_json::from_str)
                .collect::<std::result::Result<Vec<P>, _>>()?;
            if records.len() != count {
                return Err(Error::Checkpoint(format!(
                    "{} announces {} particles but holds {}",
                    path.display(),
                    count,
                    records.len()
                )));
            }
            records
        }
        None => lines
            .map(serde_json::from_str)
            .collect::<std::result::Result<Vec<P>, _>>()?,
    };
    Ok((header, records))
}

fn decode_count(bytes: &[u8]) -> Result<usize> {
    let word: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Checkpoint(format!("malformed count of {} bytes", bytes.len())))?;
    usize::try_from(u64::from_le_bytes(word))
        .map_err(|_| Error::Capacity("particle count does not fit in memory".to_string()))
}

fn received(completion: Completion) -> Result<Vec<u8>> {
    match completion {
        Completion::Received(bytes) => Ok(bytes),
        Completion::Sent => Err(TransportError::UnexpectedCompletion("send").into()),
    }
}

impl<P, T, const D: usize> ParticleSystem<P, T, D>
where
    P: Particle<D> + Serialize + DeserializeOwned,
    T: Transport,
{
    /// Write every local particle to checkpoint storage. Collective.
    ///
    /// Succeeds on every rank or fails on every rank.
    pub fn write_checkpoint<H: CheckpointHeader>(
        &mut self,
        layout: &FileLayout,
        header: &H,
    ) -> Result<()> {
        self.ensure_configured()?;
        let local = if layout.single_file {
            let gathered = self.gather_to_root();
            match self.guard(gathered)? {
                Some(all) => write_records(&layout.path_for(self.size(), 0), header, &all),
                None => Ok(()),
            }
        } else {
            let path = layout.path_for(self.size(), self.rank());
            write_records(&path, header, self.particles())
        };
        if self.rank() == 0 && local.is_ok() {
            tracing::info!("wrote checkpoint {}", layout.path_for(self.size(), 0).display());
        }
        self.agree(local)
    }

    /// Replace the local particles with the contents of a checkpoint. Collective.
    ///
    /// Returns the header. In single-file mode a read failure on rank 0
    /// aborts the whole group.
    pub fn read_checkpoint<H: CheckpointHeader>(&mut self, layout: &FileLayout) -> Result<H> {
        self.ensure_configured()?;
        if layout.single_file {
            let result = self.scatter_from_root(&layout.path_for(self.size(), 0));
            return self.guard(result);
        }
        let path = layout.path_for(self.size(), self.rank());
        let local = read_records::<H, P>(&path).map(|(header, records)| {
            let store = self.store_mut();
            store.reset(records.len().saturating_mul(4));
            for p in records {
                store.push(p);
            }
            header
        });
        self.agree(local)
    }

    /// Make every rank see a failure if any rank failed.
    fn agree<R>(&mut self, local: Result<R>) -> Result<R> {
        let flag = if local.is_ok() { 1.0 } else { 0.0 };
        let all_ok = self
            .transport_mut()
            .all_reduce(flag, ReduceOp::Min)
            .map_err(Error::from);
        let all_ok = self.guard(all_ok)? > 0.5;
        match local {
            Err(e) => Err(e),
            Ok(_) if !all_ok => Err(Error::Checkpoint(
                "checkpoint failed on another rank".to_string(),
            )),
            Ok(v) => Ok(v),
        }
    }

    /// Collect every particle on rank 0, in rank order.
    fn gather_to_root(&mut self) -> Result<Option<Vec<P>>> {
        let (store, transport) = self.parts_mut();
        let rank = transport.rank();
        let parts = transport.all_gather(&(store.len() as u64).to_le_bytes())?;
        let counts = parts
            .iter()
            .map(|b| decode_count(b))
            .collect::<Result<Vec<usize>>>()?;

        if rank != 0 {
            if !store.is_empty() {
                let bytes: &[u8] = bytemuck::cast_slice(store.as_slice());
                let request = transport.send_async(0, DATA_TAG, bytes)?;
                transport.wait_all(&[request])?;
            }
            return Ok(None);
        }

        let mut requests = Vec::new();
        for (source, &count) in counts.iter().enumerate().skip(1) {
            if count > 0 {
                requests.push(transport.recv_async(
                    source,
                    DATA_TAG,
                    count * std::mem::size_of::<P>(),
                )?);
            }
        }
        let completions = transport.wait_all(&requests)?;
        let mut all = Vec::with_capacity(counts.iter().sum());
        all.extend_from_slice(store.as_slice());
        for completion in completions {
            let bytes = received(completion)?;
            all.extend(bytemuck::pod_collect_to_vec::<u8, P>(&bytes));
        }
        Ok(Some(all))
    }

    /// Rank 0 reads `path` and deals the records out evenly; the remainder
    /// stays on rank 0.
    fn scatter_from_root<H: CheckpointHeader>(&mut self, path: &Path) -> Result<H> {
        let nproc = self.size();
        if self.rank() != 0 {
            let (store, transport) = self.parts_mut();
            let parts = transport.all_gather(&[])?;
            let header: H = serde_json::from_slice(&parts[0])?;

            let request = transport.recv_async(0, COUNT_TAG, 8)?;
            let completion = transport.wait_all(&[request])?.remove(0);
            let count = decode_count(&received(completion)?)?;

            store.reset(count.saturating_mul(4));
            if count > 0 {
                let len = count * std::mem::size_of::<P>();
                let request = transport.recv_async(0, DATA_TAG, len)?;
                let completion = transport.wait_all(&[request])?.remove(0);
                store.load_bytes(count, &received(completion)?)?;
            }
            return Ok(header);
        }

        let loaded = read_records::<H, P>(path).and_then(|(header, records)| {
            let line = serde_json::to_vec(&header)?;
            Ok((header, line, records))
        });
        let (header, line, records) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                let reason = format!("cannot read checkpoint {}: {}", path.display(), e);
                tracing::error!("{}", reason);
                self.abort_group(&reason);
                return Err(e);
            }
        };

        let total = records.len();
        let share = total / nproc;
        let own = share + total % nproc;
        tracing::info!(
            "read {} particles from {}, {} per rank ({} on rank 0)",
            total,
            path.display(),
            share,
            own
        );

        let (store, transport) = self.parts_mut();
        transport.all_gather(&line)?;

        let mut sends = Vec::with_capacity(2 * nproc);
        let counts: Vec<[u8; 8]> = (0..nproc).map(|_| (share as u64).to_le_bytes()).collect();
        for (dest, word) in counts.iter().enumerate().skip(1) {
            sends.push(transport.send_async(dest, COUNT_TAG, word)?);
        }
        if share > 0 {
            for dest in 1..nproc {
                let first = own + (dest - 1) * share;
                let bytes: &[u8] = bytemuck::cast_slice(&records[first..first + share]);
                sends.push(transport.send_async(dest, DATA_TAG, bytes)?);
            }
        }
        transport.wait_all(&sends)?;

        store.reset(own.saturating_mul(4));
        for p in &records[..own] {
            store.push(*p);
        }
        Ok(header)
    }
}
