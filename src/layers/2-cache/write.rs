// SPDX-License-Identifier: MPL-2.0

//! The write path.
//!
//! A write takes an anonymous, exclusively owned buffer, hands it to the
//! block pipeline (compression and encryption happen behind the codec
//! seam), then adopts the resulting block pointer's identity: the header
//! is inserted into the hash table so subsequent reads hit, replacing a
//! stale same-identity header left over from an overwrite.

use super::{
    buf::ArcBuf,
    hdr::{BlockPtr, BufHdr, CryptParams, HdrFlags},
    read::ReadFlags,
    state::{self, StateKind},
    ArcInner,
};
use crate::{
    layers::{bio::Abd, codec},
    os::Aead,
    prelude::*,
    util::{Aead as _, RandomInit, Rng as _},
};

/// Encoding properties of a write.
#[derive(Clone, Copy, Debug)]
pub struct WriteProps {
    pub compress: codec::Compression,
    pub complevel: u8,
    /// Encrypt the payload with the pool's loaded key.
    pub protected: bool,
}

impl Default for WriteProps {
    fn default() -> Self {
        Self {
            compress: codec::Compression::Off,
            complevel: 0,
            protected: false,
        }
    }
}

/// Invoked after the pipeline transforms complete, before the physical
/// write is issued.
pub type WriteReady = Box<dyn FnOnce(&ArcBuf) + Send + 'static>;
/// Invoked after dependent child writes may proceed.
pub type WriteChildrenReady = Box<dyn FnOnce(&ArcBuf) + Send + 'static>;
/// Invoked once the block is durable and discoverable.
pub type WriteDone = Box<dyn FnOnce(&ArcBuf, &BlockPtr) + Send + 'static>;

/// All arguments of one write beyond the buffer itself.
pub struct WriteRequest {
    pub txg: u64,
    pub props: WriteProps,
    pub uncached: bool,
    pub l2cache: bool,
    pub ready: Option<WriteReady>,
    pub children_ready: Option<WriteChildrenReady>,
    pub done: Option<WriteDone>,
}

impl Default for WriteRequest {
    fn default() -> Self {
        Self {
            txg: 0,
            props: WriteProps::default(),
            uncached: false,
            l2cache: false,
            ready: None,
            children_ready: None,
            done: None,
        }
    }
}

impl ArcInner {
    /// Writes `buf` out through the pipeline and makes its header
    /// discoverable under the returned block pointer's identity.
    pub(super) fn write_impl(
        &self,
        buf: &ArcBuf,
        mut req: WriteRequest,
    ) -> Result<BlockPtr> {
        let hdr = buf.hdr().clone();
        let spa = hdr.spa();

        // Stage 1: validate single ownership and detach the payload from
        // any aliasing, so nothing can observe bytes mid-rewrite.
        {
            let mut core = hdr.core();
            if core.state() != StateKind::Anon {
                return_errno_with_msg!(InvalidArgs, "written buffer must be released first");
            }
            if hdr.test_flags(HdrFlags::IO_IN_PROGRESS | HdrFlags::IO_ERROR) {
                return_errno_with_msg!(InvalidArgs, "written buffer has I/O in flight");
            }
            if core.l1().bufs.len() != 1 || hdr.refcnt().count() != 1 {
                return_errno_with_msg!(InvalidArgs, "written buffer must be the sole owner");
            }
            if !core.l1().acbs.is_empty() {
                return_errno_with_msg!(InvalidArgs, "written buffer has pending callbacks");
            }
            if buf.is_compressed() || buf.is_encrypted() {
                return_errno_with_msg!(Unsupported, "raw views cannot be written back");
            }
            self.unshare_for_write(&hdr, &mut core, buf.id());

            if req.uncached {
                hdr.set_flags(HdrFlags::UNCACHED);
            }
            if req.l2cache {
                hdr.set_flags(HdrFlags::L2CACHE);
            }
        }

        if let Some(ready) = req.ready.take() {
            ready(buf);
        }

        // Stage 2: pipeline transforms. The consumer's bytes become the
        // physical payload: compressed, then encrypted when asked.
        let lsize = hdr.core().lsize;
        let mut src = alloc::vec![0u8; lsize as usize];
        buf.copy_to_slice(&mut src);

        let (payload, psize, compress) = self.compress_for_write(&src, req.props)?;
        let crypt = if req.props.protected {
            Some(self.encrypt_for_write(spa, &payload)?)
        } else {
            None
        };

        {
            let mut core = hdr.core();
            let state = core.state();
            core.psize = psize;
            core.compress = compress;
            core.complevel = req.props.complevel;
            if compress != codec::Compression::Off && self.tunables.compressed_arc_enabled {
                hdr.set_flags(HdrFlags::COMPRESSED_ARC);
            }
            if let Some(old) = core.l1_mut().pabd.take() {
                self.account_payload(&hdr, state, -(old.len() as i64));
            }
            let pabd = Abd::from_slice(&payload)?;
            self.account_payload(&hdr, state, pabd.len() as i64);
            core.l1_mut().pabd = Some(pabd);
            if let Some((params, ciphertext)) = &crypt {
                if let Some(old) = core.l1_mut().rabd.take() {
                    self.account_payload(&hdr, state, -(old.len() as i64));
                }
                let rabd = Abd::from_slice(ciphertext)?;
                self.account_payload(&hdr, state, rabd.len() as i64);
                core.l1_mut().rabd = Some(rabd);
                core.crypt = Some(params.clone());
                hdr.set_flags(HdrFlags::PROTECTED);
            }
        }

        if let Some(children_ready) = req.children_ready.take() {
            children_ready(buf);
        }

        // Stage 3: the physical write.
        let on_disk: &[u8] = crypt
            .as_ref()
            .map(|(_, ciphertext)| ciphertext.as_slice())
            .unwrap_or(&payload);
        let dva = match self.pool.write_phys(req.txg, psize, lsize, on_disk) {
            Ok(dva) => dva,
            Err(e) => {
                hdr.set_flags(HdrFlags::IO_ERROR);
                return Err(e);
            }
        };

        let bp = BlockPtr {
            dva,
            birth: req.txg,
            lsize,
            psize,
            compress,
            complevel: req.props.complevel,
            blk_type: hdr.blk_type(),
            byteswap: false,
            crypt: crypt.as_ref().map(|(params, _)| params.clone()),
            embedded: None,
            hole: false,
        };

        self.write_done(&hdr, &bp)?;

        if let Some(done) = req.done.take() {
            done(buf, &bp);
        }
        Ok(bp)
    }

    /// Adopts the block pointer's identity: hash insertion with
    /// overwrite replacement, then admission into a live state.
    fn write_done(&self, hdr: &Arc<BufHdr>, bp: &BlockPtr) -> Result<()> {
        let spa = hdr.spa();
        let ident = bp.identity();

        loop {
            let mut bucket = self.table.lock_bucket(spa, &ident);
            {
                let mut core = hdr.core();
                core.ident = ident;
            }
            match self.table.insert(hdr, &mut bucket, &self.stats) {
                None => {
                    let mut core = hdr.core();
                    if core.state() == StateKind::Anon {
                        let flags = if hdr.test_flags(HdrFlags::UNCACHED) {
                            ReadFlags::UNCACHED
                        } else {
                            ReadFlags::empty()
                        };
                        self.access(hdr, &mut core, flags, false);
                    }
                    return Ok(());
                }
                Some(existing) => {
                    // An overwrite left a stale same-identity header
                    // behind; it must be unreferenced by now.
                    debug!("write displacing stale header for {:?}", ident);
                    let mut excore = existing.core();
                    debug_assert!(
                        existing.refcnt().is_zero(),
                        "overwritten block still referenced"
                    );
                    debug_assert!(!existing.test_flags(HdrFlags::IO_IN_PROGRESS));
                    if let Some(link) = excore.l1.as_mut().and_then(|l1| l1.node.take()) {
                        let ty = existing.blk_type();
                        let st = excore.state();
                        self.states.state(st).lists[ty.index()].remove(link);
                        self.states
                            .state(st)
                            .sub_esize_for(ty, state::contribution(&excore, st));
                    }
                    let mut freed = 0i64;
                    if let Some(l1) = excore.l1.as_mut() {
                        if let Some(pabd) = l1.pabd.take() {
                            freed += pabd.len() as i64;
                        }
                        if let Some(rabd) = l1.rabd.take() {
                            freed += rabd.len() as i64;
                        }
                    }
                    existing.clear_flags(HdrFlags::SHARED_DATA);
                    if freed != 0 {
                        self.account_payload(&existing, excore.state(), -freed);
                    }
                    if excore.l1.is_some() {
                        state::change_state(&self.states, &self.sizer, &existing, &mut excore, StateKind::Anon);
                    }
                    {
                        let mut zeroed = excore;
                        self.destroy_hdr(&existing, &mut zeroed, Some(&mut bucket));
                    }
                    // Retry the insertion now that the slot is free.
                    continue;
                }
            }
        }
    }

    /// Runs the compression stage, falling back to `Off` when the codec
    /// yields no saving.
    fn compress_for_write(
        &self,
        src: &[u8],
        props: WriteProps,
    ) -> Result<(Vec<u8>, u32, codec::Compression)> {
        if props.compress != codec::Compression::Off {
            let mut dst = alloc::vec![0u8; src.len().saturating_sub(1).max(1)];
            if let Some(clen) = codec::compress(props.compress, src, &mut dst) {
                dst.truncate(clen);
                return Ok((dst, clen as u32, props.compress));
            }
        }
        Ok((src.to_vec(), src.len() as u32, codec::Compression::Off))
    }

    /// Runs the encryption stage with the pool's loaded key.
    fn encrypt_for_write(&self, spa: u64, plain: &[u8]) -> Result<(CryptParams, Vec<u8>)> {
        let key = self.key_for(spa)?;
        let mut salt = [0u8; 8];
        crate::os::Rng::new(&[]).fill_bytes(&mut salt)?;
        let iv = crate::os::AeadIv::random();
        let mut ciphertext = alloc::vec![0u8; plain.len()];
        let mac = Aead::new().encrypt(plain, &key, &iv, &salt, &mut ciphertext)?;
        Ok((CryptParams { salt, iv, mac }, ciphertext))
    }
}
