//! Component A: crash-safe storage of `{current_gen, donors,
//! last_online_in, last_vote}` with a checksum (§4.1, §6).
//!
//! `save` writes the fixed binary layout to a temp file, fsyncs,
//! atomically renames over the real path, then fsyncs the containing
//! directory so the rename itself is durable. No partial write is ever
//! observable by `load`: a reader either sees the old complete file or
//! the new complete file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use submerge_base::{err, Result};
use submerge_net::{Generation, NodeID};

use crate::votestate::VoteState;

const MAGIC: u32 = 0xC606_8767;
const VERSION: u32 = 1;
const RECORD_LEN: usize = 4 + 4 + 4 + 8 * 8;

/// The five fields of §3's "per-node persistent state", bundled as one
/// atomically-written record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentState {
    pub current_gen: Generation,
    pub donors: submerge_base::NodeMask,
    pub last_online_in: u64,
    pub last_vote: VoteState,
}

impl PersistentState {
    /// The state of a node that has never switched into any
    /// generation: `current_gen` is the sentinel, `last_vote` has not
    /// voted for anything yet.
    pub fn initial() -> Self {
        PersistentState {
            current_gen: Generation::INITIAL,
            donors: submerge_base::NodeMask::EMPTY,
            last_online_in: 0,
            last_vote: VoteState::initial(),
        }
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut body = Vec::with_capacity(RECORD_LEN - 8);
        body.extend_from_slice(&VERSION.to_le_bytes());
        body.extend_from_slice(&self.current_gen.num.to_le_bytes());
        body.extend_from_slice(&self.current_gen.members.0.to_le_bytes());
        body.extend_from_slice(&self.current_gen.configured.0.to_le_bytes());
        body.extend_from_slice(&self.donors.0.to_le_bytes());
        body.extend_from_slice(&self.last_online_in.to_le_bytes());
        body.extend_from_slice(&self.last_vote.gen.num.to_le_bytes());
        body.extend_from_slice(&self.last_vote.gen.members.0.to_le_bytes());
        body.extend_from_slice(&self.last_vote.gen.configured.0.to_le_bytes());
        debug_assert_eq!(body.len(), RECORD_LEN - 8);

        let crc = crc32c::crc32c(&body);
        let mut full = [0u8; RECORD_LEN];
        full[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        full[4..8].copy_from_slice(&crc.to_le_bytes());
        full[8..].copy_from_slice(&body);
        full
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_LEN {
            return Err(err("corrupted persistent state: wrong length"));
        }
        let mut r = Reader(buf);
        let magic = r.u32();
        if magic != MAGIC {
            return Err(err("corrupted persistent state: bad magic"));
        }
        let crc = r.u32();
        let body = &buf[8..];
        if crc32c::crc32c(body) != crc {
            return Err(err("corrupted persistent state: checksum mismatch"));
        }
        let version = r.u32();
        if version != VERSION {
            return Err(err("corrupted persistent state: unknown version"));
        }
        let gen_num = r.u64();
        let gen_members = r.u64();
        let gen_configured = r.u64();
        let donors = r.u64();
        let last_online_in = r.u64();
        let vote_num = r.u64();
        let vote_members = r.u64();
        let vote_configured = r.u64();

        Ok(PersistentState {
            current_gen: Generation::new(
                gen_num,
                submerge_base::NodeMask(gen_members),
                submerge_base::NodeMask(gen_configured),
            ),
            donors: submerge_base::NodeMask(donors),
            last_online_in,
            last_vote: VoteState {
                gen: Generation::new(
                    vote_num,
                    submerge_base::NodeMask(vote_members),
                    submerge_base::NodeMask(vote_configured),
                ),
            },
        })
    }
}

/// A tiny cursor over a fixed-layout buffer; fields are read in the
/// exact order they were written, so there is nothing to seek.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u32(&mut self) -> u32 {
        let (head, tail) = self.0.split_at(4);
        self.0 = tail;
        u32::from_le_bytes(head.try_into().unwrap())
    }

    fn u64(&mut self) -> u64 {
        let (head, tail) = self.0.split_at(8);
        self.0 = tail;
        u64::from_le_bytes(head.try_into().unwrap())
    }
}

/// Owns the on-disk file path and performs the atomic save/load. Holds
/// no lock itself: callers (the Generation Manager) are responsible
/// for serializing calls under `gen_lock`, per §4.1.
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Store { path: path.into() }
    }

    /// Writes `state` via temp-file + fsync + rename + directory
    /// fsync. Must complete before any reply that could cause another
    /// node to rely on this state being durable (§4.1).
    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let tmp_path = temp_path_for(&self.path);
        let encoded = state.encode();
        {
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&encoded)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_dir(self.path.parent().unwrap_or_else(|| Path::new(".")))?;
        Ok(())
    }

    /// Reads and validates magic + version + CRC32C. Returns
    /// `CorruptedState` on any mismatch; the node must refuse to
    /// operate until an operator intervenes (§4.1, §7).
    pub fn load(&self) -> Result<PersistentState> {
        let mut f = File::open(&self.path)?;
        let mut buf = Vec::with_capacity(RECORD_LEN);
        f.read_to_end(&mut buf)?;
        PersistentState::decode(&buf)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = tmp
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tmp.set_file_name(format!("{file_name}.tmp"));
    tmp
}

/// Crash-safe storage for state whose shape isn't a fixed record — the
/// Resolver's per-gid ballot rounds (§4.8 step 2: "maintained
/// (proposal, accepted) ballot terms persisted with the prepared-xact
/// state"). Same temp-file + fsync + rename pattern as `Store`, but the
/// payload is a MessagePack blob sized to whatever the caller hands it
/// rather than `PersistentState`'s fixed binary layout, since the
/// rounds map grows and shrinks as orphans are discovered and resolved.
pub struct RoundStore {
    path: PathBuf,
}

impl RoundStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RoundStore { path: path.into() }
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let tmp_path = temp_path_for(&self.path);
        let encoded = rmp_serde::to_vec(value)?;
        {
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&encoded)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_dir(self.path.parent().unwrap_or_else(|| Path::new(".")))?;
        Ok(())
    }

    /// Returns `T::default()` if nothing has been saved yet. A resolver
    /// that loses this file only forgets its own last-proposed ballot,
    /// not anything an acceptor promised — the next round just starts
    /// from counter zero and may be refused a few times, a liveness
    /// cost only (Paxos tolerates proposer amnesia).
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match File::open(&self.path) {
            Ok(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Ok(rmp_serde::from_slice(&buf)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    // Directory fsync has no equivalent on this platform; the
    // rename is still atomic, we only lose the durability-of-the-
    // rename-itself guarantee across a crash.
    Ok(())
}

/// The initial bootstrap control file (§6): `<cluster_name>:<donor_node_id>\n`,
/// written at first startup so a basebackup-cloned node cannot mistake
/// itself for its source.
pub struct ControlFile {
    path: PathBuf,
}

impl ControlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ControlFile { path: path.into() }
    }

    pub fn write(&self, cluster_name: &str, donor: NodeID) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        writeln!(f, "{cluster_name}:{}", donor.get())?;
        f.sync_all()?;
        Ok(())
    }

    pub fn read(&self) -> Result<(String, NodeID)> {
        let contents = fs::read_to_string(&self.path)?;
        let line = contents.trim_end_matches('\n');
        let (name, donor) = line
            .rsplit_once(':')
            .ok_or_else(|| err("malformed control file"))?;
        let donor: u8 = donor.parse().map_err(|_| err("malformed control file"))?;
        Ok((name.to_string(), NodeID(donor)))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
