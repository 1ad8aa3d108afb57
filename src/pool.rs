//! Bounded worker pool. Jobs go out over a channel, results come back
//! tagged with their index so output order matches input order.

use std::thread;

use crossbeam_channel::{bounded, unbounded};
use tracing::debug;

pub fn run_pool<T, R, F>(workers: usize, jobs: Vec<T>, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = jobs.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);

    let (job_tx, job_rx) = bounded::<(usize, T)>(workers);
    let (res_tx, res_rx) = unbounded::<(usize, R)>();

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();

    thread::scope(|scope| {
        for id in 0..workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let work = &work;

            scope.spawn(move || {
                for (index, job) in job_rx.iter() {
                    debug!(worker = id, index, "job started");
                    if res_tx.send((index, work(job))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(res_tx);
        drop(job_rx);

        for (index, job) in jobs.into_iter().enumerate() {
            if job_tx.send((index, job)).is_err() {
                break;
            }
        }
        drop(job_tx);

        for (index, result) in res_rx.iter() {
            slots[index] = Some(result);
        }
    });

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn results_keep_input_order() {
        let out = run_pool(3, (0..10).collect(), |n: u64| {
            thread::sleep(Duration::from_millis(10 - n));
            n * 2
        });
        assert_eq!(out, (0..10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_worker_count() {
        let live = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        run_pool(2, vec![(); 8], |_| {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            live.fetch_sub(1, Ordering::SeqCst);
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn empty_job_list() {
        let out: Vec<u8> = run_pool(4, Vec::<u8>::new(), |x| x);
        assert!(out.is_empty());
    }
}
