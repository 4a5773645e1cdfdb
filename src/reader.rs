//! Pulling flash contents out of an unlocked boot ROM.
//!
//! A read request names an inclusive address range. The part acks it, and
//! then hands the data over in chunks, one per ack we send back. Each chunk
//! is an ordinary SOD packet whose command byte echoes the read command.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use indicatif::ProgressBar;

use crate::{
    boot::Cmd,
    context_scope,
    layout::MemoryBlock,
    link::{self, Link},
    packet::{self, Packet},
    Error, OurContext, Timing,
};

/// Start marker, length field.
const CHUNK_HEAD_LEN: usize = 3;
/// Command echo, checksum, ETX.
const CHUNK_TRAILER_LEN: usize = 3;

pub struct FlashReader<'a, L: Link + ?Sized> {
    link: &'a mut L,
    timing: Timing,
    progress: &'a ProgressBar,
}

impl<'a, L: Link + ?Sized> FlashReader<'a, L> {
    pub fn new(link: &'a mut L, timing: Timing, progress: &'a ProgressBar) -> Self {
        FlashReader { link, timing, progress }
    }

    /// Reads every block in order, committing each one to `image` before
    /// starting the next. Stops at the first block that fails.
    pub fn read_all(&mut self, blocks: &[MemoryBlock], image: &mut FlashImage) -> Result<(), Error> {
        for &block in blocks {
            log::debug!("reading {block}");
            let data = self.read_block(block)?;
            image.append_block(&data)
                .with_context(|| format!("saving block {block}"))?;
        }
        Ok(())
    }

    /// Reads one block. Any failure comes back as [`Error::BlockReadFailed`];
    /// by then the link has to be assumed out of step with the part.
    pub fn read_block(&mut self, block: MemoryBlock) -> Result<Vec<u8>, Error> {
        self.read_block_inner(block)
            .map_err(|cause| Error::BlockReadFailed { block, cause: Box::new(cause) })
    }

    fn read_block_inner(&mut self, block: MemoryBlock) -> Result<Vec<u8>, Error> {
        let mut request = Vec::with_capacity(8);
        request.extend(block.start.to_be_bytes());
        request.extend(block.end.to_be_bytes());
        link::send(self.link, &Packet::command(Cmd::ReadMemory, &request).encode())?;

        let ack = Packet::ack(Cmd::ReadMemory).encode();
        let reply = link::read_exact_bounded(
            self.link,
            ack.len(),
            self.timing.chunk_rereads,
            self.timing.chunk_backoff,
        )
        .context("waiting for read request ack")?;
        if reply != ack {
            return Err(Error::Protocol(format!("{reply:02x?} instead of read ack").into()));
        }

        let mut remaining = block.len();
        let mut data = Vec::with_capacity(remaining as usize);
        while remaining > 0 {
            let chunk = context_scope(
                || self.read_chunk(&ack),
                || format!("chunk at offset {:#x}", data.len()),
            )?;
            let len = chunk.len() as u64;
            if len == 0 {
                return Err(Error::Protocol("an empty chunk".into()));
            }
            if len > remaining {
                return Err(Error::Protocol(
                    format!("{len} bytes with only {remaining} left in the block").into(),
                ));
            }
            data.extend_from_slice(&chunk);
            remaining -= len;
            self.progress.inc(len);
        }
        Ok(data)
    }

    /// Asks for the next chunk and returns its data, with the command echo
    /// and trailer stripped.
    fn read_chunk(&mut self, ack: &[u8]) -> Result<Vec<u8>, Error> {
        link::send(self.link, ack)?;

        let head = self.read_exact(CHUNK_HEAD_LEN)?;
        let len = Packet::announced_payload_len([head[0], head[1], head[2]])?;
        log::trace!("chunk of {len} bytes announced");

        let rest = self.read_exact(len + CHUNK_TRAILER_LEN)?;

        let mut frame = head;
        frame.extend(rest);
        let packet = packet::verify(&frame)?;
        if packet.command != Cmd::ReadMemory as u8 {
            return Err(Error::Protocol(
                format!("{} in place of read data", Cmd::describe(packet.command)).into(),
            ));
        }
        Ok(packet.payload)
    }

    fn read_exact(&mut self, count: usize) -> Result<Vec<u8>, Error> {
        link::read_exact_bounded(self.link, count, self.timing.chunk_rereads, self.timing.chunk_backoff)
    }
}

/// The dumped image on disk. Blocks are appended in address order and each
/// one is flushed to storage before the next is read, so an interrupted run
/// loses at most the block in flight.
pub struct FlashImage {
    file: File,
    path: PathBuf,
    written: u64,
}

impl FlashImage {
    /// Starts a fresh image at `path`, replacing anything there.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(FlashImage { file, path: path.to_owned(), written: 0 })
    }

    /// Continues a partial image left by an earlier run. Whatever is past the
    /// last complete block is cut off. Returns the image and the number of
    /// leading `blocks` it already holds.
    pub fn resume(path: &Path, blocks: &[MemoryBlock]) -> Result<(Self, usize), Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let existing = file.metadata()
            .with_context(|| format!("examining {}", path.display()))?
            .len();

        let mut kept = 0;
        let mut done = 0;
        for block in blocks {
            if kept + block.len() > existing {
                break;
            }
            kept += block.len();
            done += 1;
        }
        if kept != existing {
            log::warn!(
                "{}: discarding {} bytes past the last complete block",
                path.display(),
                existing - kept,
            );
            file.set_len(kept)
                .with_context(|| format!("truncating {}", path.display()))?;
        }

        Ok((FlashImage { file, path: path.to_owned(), written: kept }, done))
    }

    pub fn append_block(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.write_all(data)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the image, returning its final size.
    pub fn finish(self) -> Result<u64, Error> {
        self.file.sync_all()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(self.written)
    }
}

/// What a part in unlocked state says while serving a read of `data`, split
/// into chunks of `chunk` bytes.
#[cfg(test)]
pub(crate) fn canned_read(data: &[u8], chunk: usize) -> Vec<u8> {
    let mut out = Packet::ack(Cmd::ReadMemory).encode();
    for piece in data.chunks(chunk) {
        out.extend(Packet::data(Cmd::ReadMemory as u8, piece).encode());
    }
    out
}
