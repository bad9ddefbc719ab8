// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.
//!
//! The cache core is written against this narrow seam so that the rest of
//! the crate stays agnostic of which platform supplies threads, locks and
//! ciphers. This build is backed by `std`.

use alloc::{collections::VecDeque, sync::Arc};
use core::{
    fmt,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use std::{
    sync::{self, OnceLock},
    thread,
    time::{Instant, SystemTime},
};

use aes_gcm::{
    aead::{AeadInPlace, Key, NewAead, Nonce, Tag},
    Aes128Gcm,
};
use bytemuck::{Pod, Zeroable};
pub use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Errno, Error},
    prelude::Result,
};

pub type Tid = u32;

/// A struct to get a unique identifier for the current thread.
pub struct CurrentThread;

impl CurrentThread {
    /// Returns the Tid of the current thread.
    pub fn id() -> Tid {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        hasher.finish() as Tid
    }
}

/// A mutual exclusion lock.
pub struct Mutex<T: ?Sized>(sync::Mutex<T>);

pub type MutexGuard<'a, T> = sync::MutexGuard<'a, T>;

impl<T> Mutex<T> {
    /// Creates a new lock protecting `t`.
    pub const fn new(t: T) -> Self {
        Self(sync::Mutex::new(t))
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock and gives the caller access to the data protected by it.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(sync::TryLockError::WouldBlock) => None,
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A readers-writer lock.
pub struct RwLock<T: ?Sized>(sync::RwLock<T>);

pub type RwLockReadGuard<'a, T> = sync::RwLockReadGuard<'a, T>;
pub type RwLockWriteGuard<'a, T> = sync::RwLockWriteGuard<'a, T>;

impl<T> RwLock<T> {
    /// Creates a new lock protecting `t`.
    pub const fn new(t: T) -> Self {
        Self(sync::RwLock::new(t))
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires the lock for shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires the lock for exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A `Condvar` (Condition Variable) is a synchronization primitive that can
/// block threads until a certain condition becomes true.
pub struct Condvar(sync::Condvar);

impl Condvar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self(sync::Condvar::new())
    }

    /// Atomically releases the given guard, blocking the current thread
    /// until the condition variable is notified, after which the mutex will
    /// be reacquired.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        Ok(self.0.wait(guard).unwrap_or_else(|e| e.into_inner()))
    }

    /// Like `wait`, but gives up after `timeout`. The boolean in the return
    /// value is `true` if the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        let (guard, res) = self
            .0
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        Ok((guard, res.timed_out()))
    }

    /// Wakes up one blocked thread waiting on this condition variable.
    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    /// Wakes up all blocked threads waiting on this condition variable.
    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

/// The mutex flavor paired with `Condvar`.
#[repr(transparent)]
pub struct CvarMutex<T> {
    inner: Mutex<T>,
}

impl<T> CvarMutex<T> {
    /// Constructs a new mutex usable with `Condvar`.
    pub const fn new(t: T) -> Self {
        Self {
            inner: Mutex::new(t),
        }
    }

    /// Acquires the lock and gives the caller access to the data protected by it.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        Ok(self.inner.lock())
    }
}

impl<T: fmt::Debug> fmt::Debug for CvarMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Spawns a new thread, returning a `JoinHandle` for it.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    JoinHandle {
        inner: thread::spawn(f),
    }
}

/// An owned permission to join on a thread (block on its termination).
///
/// This struct is created by the `spawn` function.
pub struct JoinHandle<T> {
    inner: thread::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Checks if the associated thread has finished running its main function.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Waits for the associated thread to finish.
    pub fn join(self) -> Result<T> {
        self.inner
            .join()
            .map_err(|_| Error::with_msg(Errno::Cancelled, "joined thread panicked"))
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

type Job = alloc::boxed::Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads consuming queued jobs.
///
/// Used for parallel eviction passes and asynchronous I/O completion.
pub struct TaskPool {
    shared: Arc<PoolShared>,
    workers: Mutex<alloc::vec::Vec<JoinHandle<()>>>,
}

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl TaskPool {
    /// Creates a pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..num_threads.max(1))
            .map(|_| {
                let shared = shared.clone();
                spawn(move || shared.run_worker())
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a job for execution on some worker. After `shutdown`,
    /// jobs run inline on the caller so nothing queued can be stranded.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut queue = self.shared.queue.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            drop(queue);
            job();
            return;
        }
        queue.push_back(alloc::boxed::Box::new(job));
        drop(queue);
        self.shared.cv.notify_one();
    }

    /// Stops accepting jobs, drains the queue and joins all workers.
    pub fn shutdown(&self) {
        {
            // Taken under the queue lock so `execute` can never slip a
            // job in behind the last worker.
            let _queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.cv.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl PoolShared {
    fn run_worker(&self) {
        loop {
            let mut queue = self.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    drop(queue);
                    job();
                    break;
                }
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                queue = self.cv.wait(queue).unwrap();
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A monotonic millisecond clock.
///
/// Injected so that lifetime-sensitive policies (prefetch minimum lifespan,
/// MRU-to-MFU promotion) can be driven by a manual clock under test.
pub trait Clock: Send + Sync {
    /// Returns monotonic milliseconds since an arbitrary epoch.
    fn ticks_ms(&self) -> u64;
}

/// The default `Clock` backed by the system monotonic timer.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn ticks_ms(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_millis() as u64
    }
}

/// A hand-driven `Clock` for exercising time-dependent policies.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Moves time forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn ticks_ms(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// A random number generator.
pub struct Rng {
    state: AtomicU64,
}

impl crate::util::Rng for Rng {
    fn new(seed: &[u8]) -> Self {
        let mut state = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e37_79b9_7f4a_7c15);
        for chunk in seed.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            state ^= u64::from_le_bytes(word);
        }
        Self {
            state: AtomicU64::new(state),
        }
    }

    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        for chunk in dest.chunks_mut(8) {
            // splitmix64 step
            let mut z = self.state.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
        }
        Ok(())
    }
}

/// A macro to define byte_array_types used by `Aead`.
macro_rules! new_byte_array_type {
    ($name:ident, $n:expr) => {
        #[repr(C)]
        #[derive(Copy, Clone, Pod, Zeroable, Debug, Default, Deserialize, Serialize)]
        pub struct $name([u8; $n]);

        impl core::ops::Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                self.0.as_slice()
            }
        }

        impl core::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                self.0.as_mut_slice()
            }
        }

        impl crate::util::RandomInit for $name {
            fn random() -> Self {
                use crate::util::Rng;

                let mut result = Self::default();
                let rng = self::Rng::new(&[]);
                rng.fill_bytes(&mut result).unwrap_or_default();
                result
            }
        }
    };
}

const AES_GCM_KEY_SIZE: usize = 16;
const AES_GCM_IV_SIZE: usize = 12;
const AES_GCM_MAC_SIZE: usize = 16;

new_byte_array_type!(AeadKey, AES_GCM_KEY_SIZE);
new_byte_array_type!(AeadIv, AES_GCM_IV_SIZE);
new_byte_array_type!(AeadMac, AES_GCM_MAC_SIZE);

/// An `AEAD` cipher.
#[derive(Debug, Default)]
pub struct Aead;

impl Aead {
    /// Construct an `Aead` instance.
    pub fn new() -> Self {
        Self
    }
}

impl crate::util::Aead for Aead {
    type Key = AeadKey;
    type Iv = AeadIv;
    type Mac = AeadMac;

    fn encrypt(
        &self,
        input: &[u8],
        key: &AeadKey,
        iv: &AeadIv,
        aad: &[u8],
        output: &mut [u8],
    ) -> Result<AeadMac> {
        let key = Key::<Aes128Gcm>::from_slice(key);
        let nonce = Nonce::<Aes128Gcm>::from_slice(iv);
        let cipher = Aes128Gcm::new(key);

        output.copy_from_slice(input);
        let tag = cipher
            .encrypt_in_place_detached(nonce, aad, output)
            .map_err(|_| Error::with_msg(Errno::EncryptFailed, "aes-128-gcm encryption failed"))?;

        let mut aead_mac = AeadMac::zeroed();
        aead_mac.copy_from_slice(&tag);
        Ok(aead_mac)
    }

    fn decrypt(
        &self,
        input: &[u8],
        key: &AeadKey,
        iv: &AeadIv,
        aad: &[u8],
        mac: &AeadMac,
        output: &mut [u8],
    ) -> Result<()> {
        let key = Key::<Aes128Gcm>::from_slice(key);
        let nonce = Nonce::<Aes128Gcm>::from_slice(iv);
        let tag = Tag::<Aes128Gcm>::from_slice(mac);
        let cipher = Aes128Gcm::new(key);

        output.copy_from_slice(input);
        cipher
            .decrypt_in_place_detached(nonce, aad, output, tag)
            .map_err(|_| {
                Error::with_msg(Errno::MacMismatched, "aes-128-gcm authentication failed")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{Aead as _, RandomInit};

    #[test]
    fn aead_round_trip_and_tamper() {
        let aead = Aead::new();
        let key = AeadKey::random();
        let iv = AeadIv::random();
        let plain = [7u8; 512];
        let mut cipher = [0u8; 512];
        let mac = aead.encrypt(&plain, &key, &iv, &[], &mut cipher).unwrap();

        let mut out = [0u8; 512];
        aead.decrypt(&cipher, &key, &iv, &[], &mac, &mut out).unwrap();
        assert_eq!(out, plain);

        cipher[100] ^= 0xff;
        let err = aead
            .decrypt(&cipher, &key, &iv, &[], &mac, &mut out)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::MacMismatched);
    }

    #[test]
    fn task_pool_runs_jobs() {
        let pool = TaskPool::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..64 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }
}
