//! Worker thread spawning with optional CPU pinning.

use std::io;
use std::thread::{self, JoinHandle};

/// A spawned worker thread.
pub(crate) struct WorkerHandle {
    pub handle: JoinHandle<()>,
    pub worker_id: usize,
    pub cpu_id: Option<usize>,
}

/// Spawn one named thread per payload; thread `i` runs
/// `worker_fn(i, payloads[i])`, pinned to `cpu_affinity[i % len]` when a
/// CPU list is given.
pub(crate) fn spawn_workers<T, F>(
    payloads: Vec<T>,
    cpu_affinity: Option<&[usize]>,
    name_prefix: &str,
    worker_fn: F,
) -> io::Result<Vec<WorkerHandle>>
where
    T: Send + 'static,
    F: Fn(usize, T) + Send + Clone + 'static,
{
    let mut handles = Vec::with_capacity(payloads.len());

    for (worker_id, payload) in payloads.into_iter().enumerate() {
        let cpu_id = cpu_affinity
            .filter(|cpus| !cpus.is_empty())
            .map(|cpus| cpus[worker_id % cpus.len()]);
        let worker_fn = worker_fn.clone();

        let handle = thread::Builder::new()
            .name(format!("{name_prefix}-{worker_id}"))
            .spawn(move || {
                if let Some(cpu) = cpu_id
                    && !pin_to_cpu(cpu)
                {
                    tracing::warn!(worker_id, cpu, "failed to pin worker thread");
                }
                worker_fn(worker_id, payload)
            })?;

        handles.push(WorkerHandle {
            handle,
            worker_id,
            cpu_id,
        });
    }

    Ok(handles)
}

/// Wait for all worker threads to finish.
pub(crate) fn join_workers(handles: Vec<WorkerHandle>) {
    for worker in handles {
        if worker.handle.join().is_err() {
            tracing::error!(worker_id = worker.worker_id, "worker thread panicked");
        }
    }
}

/// Pin the current thread to `cpu_id` via `sched_setaffinity`.
#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) -> bool {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) == 0
    }
}

/// No-op outside Linux.
#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu_id: usize) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawns_one_thread_per_payload() {
        let sum = Arc::new(AtomicUsize::new(0));
        let sum_clone = sum.clone();

        let handles = spawn_workers(vec![1usize, 2, 3], None, "test-worker", move |_, n| {
            sum_clone.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(handles.len(), 3);
        join_workers(handles);
        assert_eq!(sum.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn affinity_list_wraps() {
        let handles = spawn_workers(vec![(), (), ()], Some(&[0]), "pinned", |_, _| {}).unwrap();
        assert!(handles.iter().all(|w| w.cpu_id == Some(0)));
        join_workers(handles);
    }
}
