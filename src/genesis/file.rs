//! Genesis file format.
//!
//! Layout: magic header and version, the encoded [`GenesisHeader`], the
//! three section hashes, then the three sections by fixed order: epochs
//! (rules and initial state), blocks, and the raw EVM image. Every section
//! is a *hash-file*: its content is framed into fixed-size pieces, each
//! piece hashed, and the section hash is the linear fold of the piece
//! hashes. A reader re-derives each section hash piece by piece and
//! refuses the file on any divergence.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{Rules, Timestamp};
use crate::constants::{FILES_HASH_PIECE_SIZE, FILE_HEADER, FILE_VERSION};
use crate::event::{Epoch, Transaction};
use crate::validators::{ValidatorId, ValidatorProfile};
use crate::{hash_concat, hash_domain, Hash};

use super::{fork_proof_sender, Genesis, GenesisBlock, GenesisHeader, GenesisState};

/// Genesis file failures.
#[derive(Debug, thiserror::Error)]
pub enum GenesisFileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a genesis file (bad magic)")]
    BadHeader,
    #[error("unsupported genesis file version")]
    UnsupportedVersion,
    #[error("{0} section hash mismatch")]
    SectionHashMismatch(&'static str),
    #[error("corrupt genesis file: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("genesis section too large")]
    TooLarge,
}

/// Upper bound on one section, to keep a corrupt length prefix from
/// driving allocation.
const MAX_SECTION_BYTES: u64 = 1 << 31;

#[derive(Serialize, Deserialize)]
struct SectionHashes {
    epochs: Hash,
    blocks: Hash,
    evm: Hash,
}

#[derive(Serialize, Deserialize)]
struct EpochsSection {
    rules: Rules,
    first_epoch: Epoch,
    time: Timestamp,
    extra_data: Vec<u8>,
    validators: BTreeMap<ValidatorId, ValidatorProfile>,
}

/// One transaction inside the blocks section, with the fork-proof sender
/// rewrite applied where one exists.
#[derive(Serialize, Deserialize)]
struct SectionTx {
    tx: Transaction,
    fixed_sender: Option<[u8; 20]>,
}

#[derive(Serialize, Deserialize)]
struct SectionBlock {
    idx: u64,
    time: Timestamp,
    atropos: crate::event::EventId,
    txs: Vec<SectionTx>,
    gas_used: u64,
    root: Hash,
}

/// Linear fold of piece hashes over a section's content.
fn section_hash(content: &[u8]) -> Hash {
    let mut root = [0u8; 32];
    for piece in content.chunks(FILES_HASH_PIECE_SIZE.max(1)) {
        let piece_hash = hash_domain(b"aphelion.genesis.piece", piece);
        root = hash_concat(&[&root, &piece_hash]);
    }
    root
}

/// Write a genesis image to `writer`.
pub fn write_genesis<W: Write>(writer: &mut W, genesis: &Genesis) -> Result<(), GenesisFileError> {
    let epochs = crate::serialize(&EpochsSection {
        rules: genesis.rules.clone(),
        first_epoch: genesis.state.first_epoch,
        time: genesis.state.time,
        extra_data: genesis.state.extra_data.clone(),
        validators: genesis.state.validators.clone(),
    })?;
    let blocks = crate::serialize(
        &genesis
            .state
            .blocks
            .iter()
            .map(|block| SectionBlock {
                idx: block.idx,
                time: block.time,
                atropos: block.atropos,
                txs: block
                    .txs
                    .iter()
                    .enumerate()
                    .map(|(offset, tx)| SectionTx {
                        tx: tx.clone(),
                        fixed_sender: fork_proof_sender(block.idx, offset as u32),
                    })
                    .collect(),
                gas_used: block.gas_used,
                root: block.root,
            })
            .collect::<Vec<_>>(),
    )?;
    let evm = genesis.state.evm_items.clone();

    writer.write_all(FILE_HEADER)?;
    writer.write_all(FILE_VERSION)?;
    write_framed(writer, &crate::serialize(&genesis.header)?)?;
    write_framed(
        writer,
        &crate::serialize(&SectionHashes {
            epochs: section_hash(&epochs),
            blocks: section_hash(&blocks),
            evm: section_hash(&evm),
        })?,
    )?;
    for section in [&epochs, &blocks, &evm] {
        writer.write_all(&(section.len() as u64).to_le_bytes())?;
        writer.write_all(section)?;
    }
    Ok(())
}

/// Read and verify a genesis image from `reader`.
pub fn read_genesis<R: Read>(reader: &mut R) -> Result<Genesis, GenesisFileError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != FILE_HEADER {
        return Err(GenesisFileError::BadHeader);
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    if &version != FILE_VERSION {
        return Err(GenesisFileError::UnsupportedVersion);
    }

    let header: GenesisHeader = crate::deserialize(&read_framed(reader)?)?;
    let hashes: SectionHashes = crate::deserialize(&read_framed(reader)?)?;

    let epochs_raw = read_section(reader)?;
    if section_hash(&epochs_raw) != hashes.epochs {
        return Err(GenesisFileError::SectionHashMismatch("epochs"));
    }
    let blocks_raw = read_section(reader)?;
    if section_hash(&blocks_raw) != hashes.blocks {
        return Err(GenesisFileError::SectionHashMismatch("blocks"));
    }
    let evm_items = read_section(reader)?;
    if section_hash(&evm_items) != hashes.evm {
        return Err(GenesisFileError::SectionHashMismatch("evm"));
    }

    let epochs: EpochsSection = crate::deserialize(&epochs_raw)?;
    let blocks: Vec<SectionBlock> = crate::deserialize(&blocks_raw)?;

    Ok(Genesis {
        header,
        rules: epochs.rules,
        state: GenesisState {
            first_epoch: epochs.first_epoch,
            time: epochs.time,
            extra_data: epochs.extra_data,
            validators: epochs.validators,
            blocks: blocks
                .into_iter()
                .map(|block| GenesisBlock {
                    idx: block.idx,
                    time: block.time,
                    atropos: block.atropos,
                    txs: block.txs.into_iter().map(|tx| tx.tx).collect(),
                    gas_used: block.gas_used,
                    root: block.root,
                })
                .collect(),
            evm_items,
        },
    })
}

/// Write a genesis image to a file path.
pub fn write_genesis_file(path: &Path, genesis: &Genesis) -> Result<(), GenesisFileError> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_genesis(&mut file, genesis)?;
    file.flush()?;
    Ok(())
}

/// Read a genesis image from a file path.
pub fn read_genesis_file(path: &Path) -> Result<Genesis, GenesisFileError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    read_genesis(&mut file)
}

fn write_framed<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), GenesisFileError> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_framed<R: Read>(reader: &mut R) -> Result<Vec<u8>, GenesisFileError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len as u64 > MAX_SECTION_BYTES {
        return Err(GenesisFileError::TooLarge);
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_section<R: Read>(reader: &mut R) -> Result<Vec<u8>, GenesisFileError> {
    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_SECTION_BYTES {
        return Err(GenesisFileError::TooLarge);
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::fake_genesis;

    #[test]
    fn roundtrip() {
        let (genesis, _) = fake_genesis(3, Rules::fakenet());
        let mut buffer = Vec::new();
        write_genesis(&mut buffer, &genesis).unwrap();
        let restored = read_genesis(&mut buffer.as_slice()).unwrap();
        assert_eq!(restored, genesis);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buffer = b"Nope".to_vec();
        buffer.extend_from_slice(&[1, 0]);
        assert!(matches!(
            read_genesis(&mut buffer.as_slice()),
            Err(GenesisFileError::BadHeader)
        ));
    }

    #[test]
    fn corrupted_section_detected() {
        let (mut genesis, _) = fake_genesis(2, Rules::fakenet());
        genesis.state.evm_items = vec![7u8; 100];
        let mut buffer = Vec::new();
        write_genesis(&mut buffer, &genesis).unwrap();
        // flip a byte near the end (inside a section body)
        let target = buffer.len() - 3;
        buffer[target] ^= 0xff;
        assert!(matches!(
            read_genesis(&mut buffer.as_slice()),
            Err(GenesisFileError::SectionHashMismatch(_))
        ));
    }

    #[test]
    fn section_hash_depends_on_piece_order() {
        let a = section_hash(b"aaaabbbb");
        let b = section_hash(b"bbbbaaaa");
        assert_ne!(a, b);
        assert_ne!(section_hash(&[]), section_hash(&[0]));
    }
}
