//! Small durable records beside the journal: the voter record, written
//! before any reply that depends on it, and the committed-configuration
//! metadata file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_wire::messages::WireClusterConfig;

use crate::raft::{ClusterConfig, NodeId, Term};

const VOTER_MAGIC: u32 = 0x4A4B_5652;
const META_MAGIC: u32 = 0x4A4B_4D44;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoterRecord {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub last_known_leader: Option<NodeId>,
}

fn write_atomically(path: &Path, payload: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(payload)?;
    file.sync_data()?;
    drop(file);
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn put_opt_id(buf: &mut Vec<u8>, id: Option<NodeId>) {
    match id {
        Some(id) => {
            buf.push(1);
            let mut raw = [0u8; 4];
            BigEndian::write_u32(&mut raw, id);
            buf.extend_from_slice(&raw);
        }
        None => buf.push(0),
    }
}

fn get_opt_id(raw: &[u8], pos: &mut usize) -> Result<Option<NodeId>> {
    let flag = *raw
        .get(*pos)
        .ok_or_else(|| KeeperError::StorageFault("short voter record".into()))?;
    *pos += 1;
    match flag {
        0 => Ok(None),
        1 => {
            if raw.len() < *pos + 4 {
                return Err(KeeperError::StorageFault("short voter record".into()));
            }
            let id = BigEndian::read_u32(&raw[*pos..*pos + 4]);
            *pos += 4;
            Ok(Some(id))
        }
        _ => Err(KeeperError::StorageFault("bad voter record flag".into())),
    }
}

/// Persists `{current_term, voted_for, last_known_leader}`, fsynced on every
/// mutation.
pub struct VoterStore {
    path: Option<PathBuf>,
}

impl VoterStore {
    pub fn open(path: PathBuf) -> Result<(VoterStore, VoterRecord)> {
        let record = if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            if raw.len() < 12 || BigEndian::read_u32(&raw[0..4]) != VOTER_MAGIC {
                return Err(KeeperError::StorageFault(format!(
                    "voter record {} is corrupt",
                    path.display()
                )));
            }
            let current_term = BigEndian::read_u64(&raw[4..12]);
            let mut pos = 12;
            let voted_for = get_opt_id(&raw, &mut pos)?;
            let last_known_leader = get_opt_id(&raw, &mut pos)?;
            VoterRecord {
                current_term,
                voted_for,
                last_known_leader,
            }
        } else {
            VoterRecord::default()
        };
        Ok((VoterStore { path: Some(path) }, record))
    }

    /// A store that forgets on restart, for tests.
    pub fn ephemeral() -> VoterStore {
        VoterStore { path: None }
    }

    pub fn save(&self, record: &VoterRecord) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut buf = Vec::with_capacity(22);
        let mut raw = [0u8; 12];
        BigEndian::write_u32(&mut raw[0..4], VOTER_MAGIC);
        BigEndian::write_u64(&mut raw[4..12], record.current_term);
        buf.extend_from_slice(&raw);
        put_opt_id(&mut buf, record.voted_for);
        put_opt_id(&mut buf, record.last_known_leader);
        write_atomically(path, &buf)
    }
}

/// Records the last committed cluster configuration.
pub struct MetaStore {
    path: Option<PathBuf>,
}

impl MetaStore {
    pub fn open(path: PathBuf) -> Result<(MetaStore, Option<ClusterConfig>)> {
        let config = if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            if raw.len() < 8 || BigEndian::read_u32(&raw[0..4]) != META_MAGIC {
                return Err(KeeperError::StorageFault(format!(
                    "metadata file {} is corrupt",
                    path.display()
                )));
            }
            let len = BigEndian::read_u32(&raw[4..8]) as usize;
            if raw.len() != 8 + len {
                return Err(KeeperError::StorageFault(format!(
                    "metadata file {} is corrupt",
                    path.display()
                )));
            }
            let wire = WireClusterConfig::from_payload(&raw[8..])
                .map_err(|e| KeeperError::StorageFault(e.to_string()))?;
            Some(ClusterConfig::from_wire(wire)?)
        } else {
            None
        };
        Ok((MetaStore { path: Some(path) }, config))
    }

    pub fn ephemeral() -> MetaStore {
        MetaStore { path: None }
    }

    pub fn save(&self, config: &ClusterConfig) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let payload = config.to_wire().to_payload();
        let mut buf = Vec::with_capacity(8 + payload.len());
        let mut raw = [0u8; 8];
        BigEndian::write_u32(&mut raw[0..4], META_MAGIC);
        BigEndian::write_u32(&mut raw[4..8], payload.len() as u32);
        buf.extend_from_slice(&raw);
        buf.extend_from_slice(&payload);
        write_atomically(path, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Peer;

    #[test]
    fn voter_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voter_record");
        let (store, record) = VoterStore::open(path.clone()).unwrap();
        assert_eq!(record, VoterRecord::default());

        store
            .save(&VoterRecord {
                current_term: 9,
                voted_for: Some(2),
                last_known_leader: Some(3),
            })
            .unwrap();

        let (_, record) = VoterStore::open(path).unwrap();
        assert_eq!(record.current_term, 9);
        assert_eq!(record.voted_for, Some(2));
        assert_eq!(record.last_known_leader, Some(3));
    }

    #[test]
    fn corrupt_voter_record_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voter_record");
        fs::write(&path, b"junk").unwrap();
        assert!(matches!(
            VoterStore::open(path),
            Err(KeeperError::StorageFault(_))
        ));
    }

    #[test]
    fn meta_store_round_trips_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata");
        let (store, none) = MetaStore::open(path.clone()).unwrap();
        assert!(none.is_none());

        let config = ClusterConfig {
            voters: vec![Peer {
                id: 1,
                addr: "127.0.0.1:8801".parse().unwrap(),
            }],
            voters_old: None,
            observers: vec![Peer {
                id: 9,
                addr: "127.0.0.1:8809".parse().unwrap(),
            }],
        };
        store.save(&config).unwrap();

        let (_, loaded) = MetaStore::open(path).unwrap();
        assert_eq!(loaded, Some(config));
    }
}
