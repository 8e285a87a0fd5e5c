//! In-process communicator group, one thread per rank.
//!
//! [`InProcessCommunicator::group`] builds `world_size` communicators sharing
//! one exchange. Collectives post this rank's bytes, wait on a barrier, read
//! every rank's post and wait again before the slots are reused. Point-to-point
//! sends are buffered per `(src, dest, tag)` so a send never blocks.
//!
//! Pointers are host addresses, so only host-memory runtimes (the CPU runtime)
//! can use it. [`run_group`] drives a closure on every rank of a fresh group.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard};

use numr::dtype::DType;
use numr::error::{Error as NumrError, Result as NumrResult};
use numr::runtime::{Communicator, ReduceOp};

type MailKey = (usize, usize, u32);

struct Exchange {
    world_size: usize,
    slots: Mutex<Vec<Vec<u8>>>,
    barrier: Barrier,
    mail: Mutex<HashMap<MailKey, VecDeque<Vec<u8>>>>,
    delivered: Condvar,
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> NumrResult<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| NumrError::Internal(format!("{what} lock poisoned by a failed rank")))
}

/// One rank of an in-process group.
pub struct InProcessCommunicator {
    rank: usize,
    exchange: Arc<Exchange>,
}

impl InProcessCommunicator {
    /// `world_size` communicators, rank `r` at index `r`.
    pub fn group(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let exchange = Arc::new(Exchange {
            world_size,
            slots: Mutex::new(vec![Vec::new(); world_size]),
            barrier: Barrier::new(world_size),
            mail: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                exchange: exchange.clone(),
            })
            .collect()
    }

    /// Post `bytes`, then hand every rank's post (in rank order) to `read`.
    fn exchange<T>(&self, bytes: Vec<u8>, read: impl FnOnce(&[Vec<u8>]) -> NumrResult<T>) -> NumrResult<T> {
        lock(&self.exchange.slots, "collective")?[self.rank] = bytes;
        self.exchange.barrier.wait();
        let result = read(&lock(&self.exchange.slots, "collective")?);
        self.exchange.barrier.wait();
        result
    }
}

fn byte_len(count: usize, dtype: DType) -> usize {
    count * dtype.size_in_bytes()
}

/// Copy `len` bytes starting at host address `ptr`.
///
/// # Safety
/// `ptr` must be valid for reads of `len` bytes.
unsafe fn read_bytes(ptr: u64, len: usize) -> Vec<u8> {
    // Safety: guaranteed by the caller
    unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec()
}

/// # Safety
/// `ptr` must be valid for writes of `bytes.len()` bytes.
unsafe fn write_bytes(ptr: u64, bytes: &[u8]) {
    // Safety: guaranteed by the caller
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len()) }
}

/// Element-wise `acc = op(acc, other)` over raw buffers of `dtype`.
fn reduce_into(acc: &mut [u8], other: &[u8], dtype: DType, op: ReduceOp) -> NumrResult<()> {
    macro_rules! fold {
        ($t:ty) => {{
            const N: usize = std::mem::size_of::<$t>();
            for (a, b) in acc.chunks_exact_mut(N).zip(other.chunks_exact(N)) {
                let mut x = [0u8; N];
                let mut y = [0u8; N];
                x.copy_from_slice(a);
                y.copy_from_slice(b);
                let (x, y) = (<$t>::from_ne_bytes(x), <$t>::from_ne_bytes(y));
                let z = match op {
                    ReduceOp::Sum => x + y,
                    ReduceOp::Max => if y > x { y } else { x },
                    ReduceOp::Min => if y < x { y } else { x },
                    #[allow(unreachable_patterns)]
                    _ => {
                        return Err(NumrError::Internal(
                            "in-process reduce supports sum, max and min".to_string(),
                        ));
                    }
                };
                a.copy_from_slice(&z.to_ne_bytes());
            }
            Ok(())
        }};
    }
    match dtype {
        DType::F64 => fold!(f64),
        DType::F32 => fold!(f32),
        DType::I64 => fold!(i64),
        DType::I32 => fold!(i32),
        DType::U64 => fold!(u64),
        DType::U32 => fold!(u32),
        other => Err(NumrError::Internal(format!(
            "in-process reduce does not support {other:?}"
        ))),
    }
}

fn reduce_all(posts: &[Vec<u8>], dtype: DType, op: ReduceOp) -> NumrResult<Vec<u8>> {
    let mut acc = posts.first().cloned().unwrap_or_default();
    for other in posts.iter().skip(1) {
        if other.len() != acc.len() {
            return Err(NumrError::Internal(format!(
                "reduce over unequal buffers ({} vs {} bytes)",
                acc.len(),
                other.len()
            )));
        }
        reduce_into(&mut acc, other, dtype, op)?;
    }
    Ok(acc)
}

impl Communicator for InProcessCommunicator {
    fn world_size(&self) -> usize {
        self.exchange.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    unsafe fn all_reduce(&self, ptr: u64, count: usize, dtype: DType, op: ReduceOp) -> NumrResult<()> {
        // Safety: the caller passes a buffer of `count` elements of `dtype`
        let local = unsafe { read_bytes(ptr, byte_len(count, dtype)) };
        let reduced = self.exchange(local, |posts| reduce_all(posts, dtype, op))?;
        // Safety: same buffer, same length
        unsafe { write_bytes(ptr, &reduced) };
        Ok(())
    }

    unsafe fn broadcast(&self, ptr: u64, count: usize, dtype: DType, root: usize) -> NumrResult<()> {
        let len = byte_len(count, dtype);
        let post = if self.rank == root {
            // Safety: the caller passes a buffer of `count` elements of `dtype`
            unsafe { read_bytes(ptr, len) }
        } else {
            Vec::new()
        };
        let data = self.exchange(post, |posts| {
            posts
                .get(root)
                .filter(|p| p.len() == len)
                .cloned()
                .ok_or_else(|| NumrError::Internal(format!("broadcast root {root} posted no {len}-byte buffer")))
        })?;
        // Safety: same buffer, same length
        unsafe { write_bytes(ptr, &data) };
        Ok(())
    }

    unsafe fn all_gather(&self, send_ptr: u64, recv_ptr: u64, count: usize, dtype: DType) -> NumrResult<()> {
        let len = byte_len(count, dtype);
        // Safety: the send buffer holds `count` elements of `dtype`
        let local = unsafe { read_bytes(send_ptr, len) };
        let gathered = self.exchange(local, |posts| {
            if posts.iter().any(|p| p.len() != len) {
                return Err(NumrError::Internal("all_gather over unequal buffers".to_string()));
            }
            Ok(posts.concat())
        })?;
        // Safety: the receive buffer holds `world_size * count` elements
        unsafe { write_bytes(recv_ptr, &gathered) };
        Ok(())
    }

    unsafe fn reduce_scatter(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DType,
        op: ReduceOp,
    ) -> NumrResult<()> {
        let len = byte_len(count, dtype);
        // Safety: the send buffer holds `world_size * count` elements
        let local = unsafe { read_bytes(send_ptr, len * self.exchange.world_size) };
        let reduced = self.exchange(local, |posts| reduce_all(posts, dtype, op))?;
        let start = self.rank * len;
        // Safety: the receive buffer holds `count` elements
        unsafe { write_bytes(recv_ptr, &reduced[start..start + len]) };
        Ok(())
    }

    unsafe fn send(&self, ptr: u64, count: usize, dtype: DType, dest: usize, tag: u32) -> NumrResult<()> {
        // Safety: the caller passes a buffer of `count` elements of `dtype`
        let bytes = unsafe { read_bytes(ptr, byte_len(count, dtype)) };
        lock(&self.exchange.mail, "mailbox")?
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(bytes);
        self.exchange.delivered.notify_all();
        Ok(())
    }

    unsafe fn recv(&self, ptr: u64, count: usize, dtype: DType, src: usize, tag: u32) -> NumrResult<()> {
        let capacity = byte_len(count, dtype);
        let key = (src, self.rank, tag);
        let mut mail = lock(&self.exchange.mail, "mailbox")?;
        let bytes = loop {
            if let Some(bytes) = mail.get_mut(&key).and_then(VecDeque::pop_front) {
                break bytes;
            }
            mail = self
                .exchange
                .delivered
                .wait(mail)
                .map_err(|_| NumrError::Internal("mailbox lock poisoned by a failed rank".to_string()))?;
        };
        drop(mail);
        if bytes.len() > capacity {
            return Err(NumrError::Internal(format!(
                "message of {} bytes from rank {src} (tag {tag}) exceeds the {capacity}-byte buffer",
                bytes.len()
            )));
        }
        // Safety: the receive buffer holds at least `bytes.len()` bytes
        unsafe { write_bytes(ptr, &bytes) };
        Ok(())
    }

    fn sync(&self) -> NumrResult<()> {
        Ok(())
    }

    fn barrier(&self) -> NumrResult<()> {
        self.exchange.barrier.wait();
        Ok(())
    }
}

/// Run `f` on every rank of a fresh `world_size` group, one thread each, and
/// return the per-rank results in rank order. A panicking rank panics the caller.
pub fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Arc<dyn Communicator>) -> T + Sync,
{
    let comms = InProcessCommunicator::group(world_size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || f(Arc::new(comm)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}
