//! Events export and import files.
//!
//! Format: magic header, version bytes, then a stream of length-prefixed
//! encoded events in id order. A `.zst` path suffix transparently wraps
//! the stream in zstd compression. Import replays the stream through the
//! processor and is cooperatively cancellable: a cancellation is honored
//! after the in-flight event finishes, surfacing as `Interrupted`.

use std::io::{Read, Write};
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::constants::{FILE_HEADER, FILE_VERSION, MAX_EVENT_BYTES};
use crate::event::{codec, Epoch, EventId};
use crate::checkers::EventCheckError;
use crate::processor::{ProcessError, Processor};
use crate::store::{Store, StoreError};

/// Export failures.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Import failures.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not an events file (bad magic)")]
    BadHeader,
    #[error("unsupported events file version")]
    UnsupportedVersion,
    #[error("corrupt events file: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("import interrupted")]
    Interrupted,
    #[error(transparent)]
    Process(Box<ProcessError>),
}

/// Import counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: u64,
    pub skipped: u64,
}

/// Write every stored event with `from ≤ epoch ≤ to`, in id order.
/// Returns the number of events written.
pub fn export_events<W: Write>(
    store: &Store,
    writer: &mut W,
    from: Epoch,
    to: Epoch,
) -> Result<u64, ExportError> {
    writer.write_all(FILE_HEADER)?;
    writer.write_all(FILE_VERSION)?;

    let mut written = 0u64;
    let mut io_error: Option<std::io::Error> = None;
    store.for_each_event_from(EventId::epoch_floor(from).as_bytes(), |id, encoded| {
        if id.epoch() > to {
            return false;
        }
        let frame = (encoded.len() as u32).to_le_bytes();
        match writer
            .write_all(&frame)
            .and_then(|()| writer.write_all(encoded))
        {
            Ok(()) => {
                written += 1;
                true
            }
            Err(err) => {
                io_error = Some(err);
                false
            }
        }
    })?;
    if let Some(err) = io_error {
        return Err(err.into());
    }
    tracing::info!(events = written, "Exported events");
    Ok(written)
}

/// Export to a path; a `.zst` suffix enables compression.
pub fn export_events_to_path(
    store: &Store,
    path: &Path,
    from: Epoch,
    to: Epoch,
) -> Result<u64, ExportError> {
    let file = std::fs::File::create(path)?;
    if path.extension().is_some_and(|ext| ext == "zst") {
        let mut encoder = zstd::Encoder::new(file, 0)?;
        let written = export_events(store, &mut encoder, from, to)?;
        encoder.finish()?.flush()?;
        Ok(written)
    } else {
        let mut writer = std::io::BufWriter::new(file);
        let written = export_events(store, &mut writer, from, to)?;
        writer.flush()?;
        Ok(written)
    }
}

/// Replay an events stream through the processor. Already-connected and
/// not-currently-relevant events count as skipped; any other failure
/// aborts. Returns at end-of-stream, or `Interrupted` once `cancel` fires.
pub fn import_events<R: Read>(
    processor: &Processor,
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<ImportStats, ImportError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != FILE_HEADER {
        return Err(ImportError::BadHeader);
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    if &version != FILE_VERSION {
        return Err(ImportError::UnsupportedVersion);
    }

    let mut stats = ImportStats::default();
    loop {
        if cancel.is_cancelled() {
            tracing::warn!(
                imported = stats.imported,
                "Import interrupted"
            );
            return Err(ImportError::Interrupted);
        }
        let Some(frame) = read_frame(reader)? else {
            break;
        };
        let event = codec::decode(&frame)?;
        // full pre-admission validation: the file is untrusted input
        let admitted = processor
            .validate_event(&event)
            .and_then(|()| processor.process_event(event));
        match admitted {
            Ok(()) => stats.imported += 1,
            Err(ProcessError::AlreadyConnected)
            | Err(ProcessError::Check(EventCheckError::NotRelevantEpoch { .. })) => {
                stats.skipped += 1
            }
            Err(err) => return Err(ImportError::Process(Box::new(err))),
        }
    }
    tracing::info!(
        imported = stats.imported,
        skipped = stats.skipped,
        "Import finished"
    );
    Ok(stats)
}

/// Import from a path; a `.zst` suffix enables decompression.
pub fn import_events_from_path(
    processor: &Processor,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<ImportStats, ImportError> {
    let file = std::fs::File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "zst") {
        let mut decoder = zstd::Decoder::new(file)?;
        import_events(processor, &mut decoder, cancel)
    } else {
        let mut reader = std::io::BufReader::new(file);
        import_events(processor, &mut reader, cancel)
    }
}

/// One length-prefixed frame, or `None` at a clean end of stream.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ImportError> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_EVENT_BYTES {
        return Err(ImportError::Codec(codec::CodecError::TooLarge(
            MAX_EVENT_BYTES,
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::builder::EventBuilder;
    use crate::validators::ValidatorId;

    fn store_with_events(epoch: u32, count: u32) -> Store {
        let store = Store::open_temporary().unwrap();
        for lamport in 1..=count {
            let event = EventBuilder::new()
                .epoch(epoch)
                .creator(ValidatorId(1))
                .seq(lamport)
                .lamport(lamport)
                .creation_time(lamport as u64)
                .build();
            store.set_event(&event).unwrap();
        }
        store
    }

    #[test]
    fn export_writes_header_and_frames() {
        let store = store_with_events(1, 3);
        let mut buffer = Vec::new();
        let written = export_events(&store, &mut buffer, 1, 1).unwrap();
        assert_eq!(written, 3);
        assert_eq!(&buffer[0..4], FILE_HEADER);
        assert_eq!(&buffer[4..6], FILE_VERSION);

        // frames decode back to events in id order
        let mut reader = &buffer[6..];
        let mut lamports = Vec::new();
        while let Some(frame) = read_frame(&mut reader).unwrap() {
            lamports.push(codec::decode(&frame).unwrap().event().lamport());
        }
        assert_eq!(lamports, vec![1, 2, 3]);
    }

    #[test]
    fn export_respects_epoch_bounds() {
        let store = store_with_events(1, 2);
        for lamport in 1..=2u32 {
            let event = EventBuilder::new()
                .epoch(5)
                .creator(ValidatorId(1))
                .seq(lamport)
                .lamport(lamport)
                .creation_time(lamport as u64)
                .build();
            store.set_event(&event).unwrap();
        }
        let mut buffer = Vec::new();
        assert_eq!(export_events(&store, &mut buffer, 1, 1).unwrap(), 2);
        let mut buffer = Vec::new();
        assert_eq!(export_events(&store, &mut buffer, 1, 5).unwrap(), 4);
    }

    #[test]
    fn bad_magic_rejected() {
        let store = Store::open_temporary().unwrap();
        let processor = crate::processor::Processor::new(
            {
                let (genesis, _) = crate::genesis::fake_genesis(1, crate::config::Rules::fakenet());
                crate::genesis::apply_genesis(
                    &store,
                    &genesis,
                    &mut crate::genesis::FakeBlockProc::new(),
                )
                .unwrap();
                std::sync::Arc::new(store)
            },
            Box::new(crate::engine::NullEngine),
            crate::config::Rules::fakenet(),
            std::sync::Arc::new(crate::processor::NullEmitter),
        )
        .unwrap();
        let result = import_events(
            &processor,
            &mut b"Junk..".as_slice(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ImportError::BadHeader)));
    }
}
