// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IMG3 tagged-container format.
//!
//! An IMG3 file is a 20-byte header followed by a sequence of chunks, each
//! a 12-byte header (tag, total length, data length) plus payload and
//! padding. The device verifies the payload of the `SHSH` chunk against the
//! rest of the file; restoring to a different device means overwriting that
//! payload with the signature blob issued for it. The replacement is done
//! in place so every chunk we do not understand survives byte-for-byte.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::Error;

// Tags read as four ASCII characters when the little-endian field is
// byte-reversed; `from_be_bytes` reproduces the on-disk encoding.
const fn fourcc(tag: [u8; 4]) -> u32 {
    u32::from_be_bytes(tag)
}

const IMG3_MAGIC: u32 = fourcc(*b"Img3");
const SIGNATURE_TAG: u32 = fourcc(*b"SHSH");

const HEADER_LEN: usize = std::mem::size_of::<Header>();
const CHUNK_HEADER_LEN: usize = std::mem::size_of::<ChunkHeader>();

#[derive(FromZeroes, FromBytes, AsBytes, Debug, Clone, Copy)]
#[repr(C)]
struct Header {
    magic: u32,
    /// Total file length, header included.
    full_size: u32,
    /// Length of the chunk sequence (everything after this header).
    size_no_pack: u32,
    /// Length of the chunk prefix covered by the signature check.
    sig_check_area: u32,
    /// Component type tag, e.g. `krnl` or `ibec`.
    ident: u32,
}

#[derive(FromZeroes, FromBytes, AsBytes, Debug, Clone, Copy)]
#[repr(C)]
struct ChunkHeader {
    tag: u32,
    /// Chunk length including this header and trailing padding.
    total_len: u32,
    /// Payload length, padding excluded.
    data_len: u32,
}

/// One chunk, kept as the raw bytes it occupied in the file so that
/// serialization reproduces untouched chunks exactly, padding included.
#[derive(Debug, Clone)]
struct Chunk {
    tag: u32,
    raw: Vec<u8>,
}

impl Chunk {
    fn data_len(&self) -> usize {
        // Validated against `raw` during parse.
        ChunkHeader::read_from_prefix(&self.raw).unwrap().data_len as usize
    }

    fn payload(&self) -> &[u8] {
        &self.raw[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + self.data_len()]
    }
}

/// A parsed IMG3 container.
#[derive(Debug, Clone)]
pub struct Img3 {
    header: Header,
    chunks: Vec<Chunk>,
}

impl Img3 {
    /// Parses and validates the container framing.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let header = Header::read_from_prefix(data)
            .ok_or(Error::ContainerMalformed("truncated header"))?;
        if header.magic != IMG3_MAGIC {
            return Err(Error::ContainerMalformed("bad magic"));
        }
        if header.full_size as usize != data.len() {
            return Err(Error::ContainerMalformed(
                "length field disagrees with input length",
            ));
        }

        let mut chunks = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < data.len() {
            let chunk = ChunkHeader::read_from_prefix(&data[offset..])
                .ok_or(Error::ContainerMalformed("truncated chunk header"))?;
            let total_len = chunk.total_len as usize;
            if total_len < CHUNK_HEADER_LEN {
                return Err(Error::ContainerMalformed("chunk shorter than its header"));
            }
            if chunk.data_len as usize + CHUNK_HEADER_LEN > total_len {
                return Err(Error::ContainerMalformed("chunk data overruns its frame"));
            }
            if offset + total_len > data.len() {
                return Err(Error::ContainerMalformed("chunk overruns the container"));
            }
            chunks.push(Chunk {
                tag: chunk.tag,
                raw: data[offset..offset + total_len].to_vec(),
            });
            offset += total_len;
        }

        Ok(Self { header, chunks })
    }

    /// The component type tag, as the four on-disk characters.
    pub fn ident(&self) -> [u8; 4] {
        self.header.ident.to_be_bytes()
    }

    /// Payload of the signature chunk, if present.
    pub fn signature(&self) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|c| c.tag == SIGNATURE_TAG)
            .map(Chunk::payload)
    }

    /// Overwrites the signature chunk's payload with `blob`, adjusting the
    /// chunk frame and the header length fields for any size change. The
    /// signature check area is untouched: it covers the chunks preceding
    /// `SHSH`, none of which move.
    pub fn replace_signature(&mut self, blob: &[u8]) -> Result<(), Error> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| c.tag == SIGNATURE_TAG)
            .ok_or(Error::NoSignatureChunk)?;

        let padded = (blob.len() + 3) & !3;
        let total_len = CHUNK_HEADER_LEN + padded;
        let mut raw = Vec::with_capacity(total_len);
        raw.extend_from_slice(
            ChunkHeader {
                tag: SIGNATURE_TAG,
                total_len: total_len as u32,
                data_len: blob.len() as u32,
            }
            .as_bytes(),
        );
        raw.extend_from_slice(blob);
        raw.resize(total_len, 0);

        let delta = total_len as i64 - chunk.raw.len() as i64;
        chunk.raw = raw;
        self.header.full_size = (self.header.full_size as i64 + delta) as u32;
        self.header.size_no_pack = (self.header.size_no_pack as i64 + delta) as u32;
        Ok(())
    }

    /// Emits the container, byte-identical to the parsed input except for a
    /// replaced signature chunk and the header length fields it moves.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.full_size as usize);
        out.extend_from_slice(self.header.as_bytes());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.raw);
        }
        out
    }
}
