// SPDX-License-Identifier: MPL-2.0

//! Consumer buffers.
//!
//! A consumer buffer is a view of one header's payload: raw ciphertext,
//! compressed plaintext, or fully decoded bytes. A decoded view may
//! alias the header's physical payload (`SharedWithHdr`) when their byte
//! representations coincide; everything else owns its allocation. The
//! header's `SHARED_DATA` flag tracks that exactly one buffer aliases the
//! payload, and an uncompressed shared buffer is kept last on the list.

use super::{
    hdr::{BufEntry, BufHdr, BufPayload, HdrCore, HdrFlags},
    state::{self, StateKind},
    ArcInner,
};
use crate::{
    layers::{bio::Abd, codec},
    os::Aead,
    prelude::*,
    util::{Aead as _, RefTag},
};

/// A consumer's handle to one cached block.
pub struct ArcBuf {
    hdr: Arc<BufHdr>,
    id: u64,
    lsize: u32,
    psize: u32,
    compressed: bool,
    encrypted: bool,
}

impl ArcBuf {
    pub(super) fn new(
        hdr: Arc<BufHdr>,
        id: u64,
        lsize: u32,
        psize: u32,
        compressed: bool,
        encrypted: bool,
    ) -> Self {
        Self {
            hdr,
            id,
            lsize,
            psize,
            compressed,
            encrypted,
        }
    }

    pub(super) fn hdr(&self) -> &Arc<BufHdr> {
        &self.hdr
    }

    pub(super) fn set_hdr(&mut self, hdr: Arc<BufHdr>) {
        self.hdr = hdr;
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    /// The byte size of this view: the physical size for compressed or
    /// raw views, the logical size otherwise. Overhead accounting uses
    /// this same value, so the two never diverge for encrypted views.
    pub fn size(&self) -> usize {
        if self.compressed || self.encrypted {
            self.psize as usize
        } else {
            self.lsize as usize
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Runs `f` over the view's bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let core = self.hdr.core();
        let entry = find_entry(&core, self.id).expect("buffer vanished from its header");
        match &entry.payload {
            BufPayload::Owned(abd) => f(abd.as_slice()),
            BufPayload::SharedWithHdr => {
                let pabd = core.l1().pabd.as_ref().expect("shared buffer without pabd");
                f(&pabd.as_slice()[..self.size()])
            }
        }
    }

    /// Copies the view into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `dst` length differs from `self.size()`.
    pub fn copy_to_slice(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.size());
        self.with_data(|data| dst.copy_from_slice(data));
    }

    /// Fills an anonymous, exclusively owned buffer with `src`. Only
    /// buffers handed out by `alloc_buf`/`loan_buf` may be written.
    pub fn write_from_slice(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.size() {
            return_errno_with_msg!(InvalidArgs, "source length differs from the buffer size");
        }
        let mut core = self.hdr.core();
        if core.state() != StateKind::Anon {
            return_errno_with_msg!(InvalidArgs, "only anonymous buffers are writable");
        }
        let entry = find_entry_mut(&mut core, self.id).expect("buffer vanished from its header");
        match &mut entry.payload {
            BufPayload::Owned(abd) => {
                abd.as_mut_slice().copy_from_slice(src);
                Ok(())
            }
            BufPayload::SharedWithHdr => {
                return_errno_with_msg!(InvalidArgs, "shared buffers are not writable")
            }
        }
    }
}

impl Debug for ArcBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcBuf")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("compressed", &self.compressed)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

pub(super) fn find_entry<'a>(core: &'a HdrCore, id: u64) -> Option<&'a BufEntry> {
    core.l1().bufs.iter().find(|e| e.id == id)
}

pub(super) fn find_entry_mut<'a>(core: &'a mut HdrCore, id: u64) -> Option<&'a mut BufEntry> {
    core.l1_mut().bufs.iter_mut().find(|e| e.id == id)
}

/// What view of the payload a consumer asked for.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct FillKind {
    pub want_compressed: bool,
    pub want_encrypted: bool,
}

impl ArcInner {
    /// Materializes a consumer buffer over `hdr`, sharing with the
    /// physical payload when representations allow it, otherwise
    /// decrypting and decompressing into an owned allocation.
    ///
    /// The caller holds the bucket lock; the new reference is owned by
    /// `tag`.
    pub(super) fn alloc_buf_impl(
        &self,
        hdr: &Arc<BufHdr>,
        core: &mut HdrCore,
        tag: RefTag,
        kind: FillKind,
    ) -> Result<ArcBuf> {
        let (lsize, psize) = (core.lsize, core.psize);
        let hdr_compressed = core.compress != codec::Compression::Off;
        state::add_ref(&self.states, hdr, core, tag);

        let result = self.fill_payload(hdr, core, kind);
        let (payload, compressed, encrypted) = match result {
            Ok(v) => v,
            Err(e) => {
                state::remove_ref(&self.states, hdr, core, tag);
                return Err(e);
            }
        };

        let id = self.next_buf_id();
        let entry = BufEntry {
            id,
            payload,
            compressed: compressed && hdr_compressed,
            encrypted,
        };
        if let BufPayload::Owned(abd) = &entry.payload {
            self.account_payload(hdr, core.state(), abd.len() as i64);
        }

        // An uncompressed shared buffer must stay last on the list.
        let bufs = &mut core.l1_mut().bufs;
        let insert_at = match bufs.last() {
            Some(last) if last.is_shared() && !last.compressed && !entry.is_shared() => {
                bufs.len() - 1
            }
            _ => bufs.len(),
        };
        bufs.insert(insert_at, entry);

        Ok(ArcBuf::new(
            hdr.clone(),
            id,
            lsize,
            psize,
            compressed && hdr_compressed,
            encrypted,
        ))
    }

    /// Produces the payload for a requested view, decrypting and
    /// decompressing as needed.
    fn fill_payload(
        &self,
        hdr: &Arc<BufHdr>,
        core: &mut HdrCore,
        kind: FillKind,
    ) -> Result<(BufPayload, bool, bool)> {
        if kind.want_encrypted {
            let rabd = core
                .l1()
                .rabd
                .as_ref()
                .ok_or(Error::with_msg(NotFound, "no raw payload cached"))?;
            return Ok((
                BufPayload::Owned(Abd::from_slice(rabd.as_slice())?),
                true,
                true,
            ));
        }

        // A plaintext view of a protected block needs the key.
        if hdr.test_flags(HdrFlags::PROTECTED) && core.l1().pabd.is_none() {
            self.decrypt_into_pabd(hdr, core)?;
        }

        if kind.want_compressed {
            if !hdr.test_flags(HdrFlags::COMPRESSED_ARC) {
                return_errno_with_msg!(
                    Unsupported,
                    "compressed view of an uncompressed-in-memory block"
                );
            }
            // Compressed shared buffers may live anywhere on the list,
            // but only one buffer may alias the payload.
            if !hdr.test_flags(HdrFlags::SHARED_DATA | HdrFlags::L2_WRITING) {
                hdr.set_flags(HdrFlags::SHARED_DATA);
                return Ok((BufPayload::SharedWithHdr, true, false));
            }
            let pabd = core.l1().pabd.as_ref().expect("compressed hdr without pabd");
            return Ok((
                BufPayload::Owned(Abd::from_slice(pabd.as_slice())?),
                true,
                false,
            ));
        }

        // Decoded view.
        let pabd = core
            .l1()
            .pabd
            .as_ref()
            .ok_or(Error::with_msg(NotFound, "no payload cached"))?;
        if core.compress == codec::Compression::Off {
            let sharable = !core.byteswap
                && !hdr.test_flags(
                    HdrFlags::PROTECTED | HdrFlags::SHARED_DATA | HdrFlags::L2_WRITING,
                );
            if sharable {
                hdr.set_flags(HdrFlags::SHARED_DATA);
                return Ok((BufPayload::SharedWithHdr, false, false));
            }
            return Ok((
                BufPayload::Owned(Abd::from_slice(pabd.as_slice())?),
                false,
                false,
            ));
        }

        let mut out = Abd::alloc(core.lsize as usize)?;
        codec::decompress(core.compress, pabd.as_slice(), out.as_mut_slice())?;
        Ok((BufPayload::Owned(out), false, false))
    }

    /// Authenticates and decrypts the raw payload into `pabd`.
    ///
    /// Fails with `KeyUnavailable` when the pool's key is not loaded and
    /// with `MacMismatched` when authentication fails; the read boundary
    /// converts the latter into an I/O error.
    pub(super) fn decrypt_into_pabd(&self, hdr: &Arc<BufHdr>, core: &mut HdrCore) -> Result<()> {
        if hdr.test_flags(HdrFlags::NOAUTH) {
            // Unauthenticated objects carry plaintext in rabd.
            let rabd = core
                .l1()
                .rabd
                .as_ref()
                .ok_or(Error::with_msg(NotFound, "no raw payload cached"))?;
            let pabd = Abd::from_slice(rabd.as_slice())?;
            self.account_payload(hdr, core.state(), pabd.len() as i64);
            core.l1_mut().pabd = Some(pabd);
            return Ok(());
        }

        let key = self.key_for(hdr.spa())?;
        let crypt = core
            .crypt
            .clone()
            .ok_or(Error::with_msg(InvalidArgs, "protected header without crypt params"))?;
        let rabd = core
            .l1()
            .rabd
            .as_ref()
            .ok_or(Error::with_msg(NotFound, "no raw payload cached"))?;

        let mut plain = Abd::alloc(rabd.len())?;
        Aead::new().decrypt(
            rabd.as_slice(),
            &key,
            &crypt.iv,
            &crypt.salt,
            &crypt.mac,
            plain.as_mut_slice(),
        )?;
        self.account_payload(hdr, core.state(), plain.len() as i64);
        core.l1_mut().pabd = Some(plain);
        Ok(())
    }

    /// Detaches a buffer entry from its header, fixing sharing state and
    /// payload accounting. Returns the entry.
    pub(super) fn detach_buf_entry(
        &self,
        hdr: &Arc<BufHdr>,
        core: &mut HdrCore,
        id: u64,
    ) -> Result<BufEntry> {
        let bufs = &mut core.l1_mut().bufs;
        let pos = bufs
            .iter()
            .position(|e| e.id == id)
            .ok_or(Error::with_msg(NotFound, "buffer not found on its header"))?;
        let entry = bufs.remove(pos);
        if entry.is_shared() {
            hdr.clear_flags(HdrFlags::SHARED_DATA);
        }
        if let BufPayload::Owned(abd) = &entry.payload {
            self.account_payload(hdr, core.state(), -(abd.len() as i64));
        }
        Ok(entry)
    }

    /// Converts a shared buffer into an exclusive owner of the payload:
    /// the header gives up `pabd` entirely. Used by the write path so a
    /// concurrent L2 feed never reads bytes a writer is about to change.
    pub(super) fn unshare_for_write(&self, hdr: &Arc<BufHdr>, core: &mut HdrCore, id: u64) {
        let entry = find_entry(core, id).expect("buffer vanished from its header");
        if !entry.is_shared() {
            return;
        }
        let pabd = core.l1_mut().pabd.take().expect("shared buffer without pabd");
        let entry = find_entry_mut(core, id).unwrap();
        entry.payload = BufPayload::Owned(pabd);
        hdr.clear_flags(HdrFlags::SHARED_DATA);
        // Bytes moved from the header to the buffer: totals unchanged.
    }
}
