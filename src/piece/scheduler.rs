use super::PieceWork;
use crate::peer::Bitfield;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Capacity of the channel that carries recycled pieces back to the pool.
const RETURN_QUEUE: usize = 50;

/// Find the key nearest to `target`.
///
/// Returns the index and its signed distance (`index - target`). When a
/// piece before and a piece after the target are equally far, the one after
/// wins, since playback moves forward.
pub fn find_closest<V>(pieces: &BTreeMap<u32, V>, target: i64) -> Option<(u32, i64)> {
    find_closest_where(pieces, target, |_| true)
}

/// [`find_closest`] over the keys accepted by `wanted`.
pub fn find_closest_where<V>(
    pieces: &BTreeMap<u32, V>,
    target: i64,
    wanted: impl Fn(u32) -> bool,
) -> Option<(u32, i64)> {
    let distance = |index: u32| index as i64 - target;
    let pivot = target.clamp(0, u32::MAX as i64) as u32;

    let below = pieces.range(..pivot).rev().map(|(&i, _)| i).find(|&i| wanted(i));
    let above = pieces.range(pivot..).map(|(&i, _)| i).find(|&i| wanted(i));

    match (below, above) {
        (Some(b), Some(a)) => {
            if distance(b).abs() < distance(a).abs() {
                Some((b, distance(b)))
            } else {
                Some((a, distance(a)))
            }
        }
        (Some(i), None) | (None, Some(i)) => Some((i, distance(i))),
        (None, None) => None,
    }
}

/// Pending pieces ordered by index, plus the cached pick for the current target.
#[derive(Debug, Default)]
pub struct PiecePool {
    pieces: BTreeMap<u32, PieceWork>,
    target: i64,
    closest: Option<u32>,
}

impl PiecePool {
    pub fn new(pieces: Vec<PieceWork>, target: i64) -> Self {
        let mut pool = Self {
            pieces: pieces.into_iter().map(|p| (p.index, p)).collect(),
            target,
            closest: None,
        };
        pool.refresh();
        pool
    }

    fn refresh(&mut self) {
        self.closest = find_closest(&self.pieces, self.target).map(|(index, _)| index);
    }

    pub fn set_target(&mut self, target: i64) {
        self.target = target;
        self.refresh();
    }

    /// Index that the next `take_closest` would hand out.
    pub fn closest(&self) -> Option<u32> {
        self.closest
    }

    /// Remove and return the piece nearest to the target.
    #[cfg(test)]
    pub fn take_closest(&mut self) -> Option<PieceWork> {
        self.take_closest_where(|_| true)
    }

    /// Remove and return the piece nearest to the target among those `wanted` accepts.
    pub fn take_closest_where(&mut self, wanted: impl Fn(u32) -> bool) -> Option<PieceWork> {
        let index = match self.closest {
            Some(index) if wanted(index) => index,
            _ => find_closest_where(&self.pieces, self.target, wanted)?.0,
        };
        let work = self.pieces.remove(&index);
        self.refresh();
        work
    }

    /// Reinsert a piece in index order.
    pub fn put_back(&mut self, work: PieceWork) {
        match self.pieces.remove(&work.index) {
            Some(existing) => {
                error!("Piece {} returned while already pending", work.index);
                // keep whichever copy carries partial progress, preferring the newest
                let keep = if work.progress.is_some() || existing.progress.is_none() {
                    work
                } else {
                    existing
                };
                self.pieces.insert(keep.index, keep);
            }
            None => {
                self.pieces.insert(work.index, work);
            }
        }
        self.refresh();
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// An idle worker asking for work it can fetch from its peer.
struct PieceRequest {
    available: Bitfield,
    reply: oneshot::Sender<PieceWork>,
}

/// Owner of the pending-piece pool for one download.
///
/// The pool lives inside a single task that reacts to three events: a new
/// target index, a piece coming back, and an idle worker asking for work.
/// A worker is only ever offered pieces its peer advertises; when none are
/// pending it waits until one comes back.
pub struct Scheduler {
    pool: PiecePool,
    priorities: mpsc::UnboundedReceiver<i64>,
    requests: mpsc::Receiver<PieceRequest>,
    returns: mpsc::Receiver<PieceWork>,
    waiting: VecDeque<PieceRequest>,
}

/// Worker-side access to a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    requests: mpsc::Sender<PieceRequest>,
    returns: mpsc::Sender<PieceWork>,
}

impl Scheduler {
    /// Start the scheduling loop. It stops once `cancel` fires.
    pub fn spawn(
        pieces: Vec<PieceWork>,
        target: i64,
        priorities: mpsc::UnboundedReceiver<i64>,
        cancel: CancellationToken,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(1);
        let (return_tx, return_rx) = mpsc::channel(RETURN_QUEUE);

        let scheduler = Self {
            pool: PiecePool::new(pieces, target),
            priorities,
            requests: request_rx,
            returns: return_rx,
            waiting: VecDeque::new(),
        };
        let handle = SchedulerHandle {
            requests: request_tx,
            returns: return_tx,
        };

        (handle, tokio::spawn(scheduler.run(cancel)))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Scheduler started with {} pieces, top piece {:?}",
            self.pool.len(),
            self.pool.closest()
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(target) = self.priorities.recv() => {
                    self.pool.set_target(target);
                    debug!(
                        "Got priority update={}; new top piece {:?}",
                        target,
                        self.pool.closest()
                    );
                }
                Some(work) = self.returns.recv() => {
                    debug!("Piece {} returned to the pool", work.index);
                    self.pool.put_back(work);
                    self.serve_waiting();
                }
                Some(request) = self.requests.recv() => self.offer(request),
            }
        }

        debug!("Scheduler stopped with {} pieces pending", self.pool.len());
        // dropping the receivers and parked requests wakes every worker
    }

    fn offer(&mut self, request: PieceRequest) {
        let next = self.pool.take_closest_where(|index| request.available.has(index));
        match next {
            Some(work) => {
                if let Err(work) = request.reply.send(work) {
                    // the worker went away between asking and receiving
                    self.pool.put_back(work);
                } else if self.pool.is_empty() {
                    debug!("All pieces are handed out");
                }
            }
            None => self.waiting.push_back(request),
        }
    }

    fn serve_waiting(&mut self) {
        for request in std::mem::take(&mut self.waiting) {
            if !request.reply.is_closed() {
                self.offer(request);
            }
        }
    }
}

impl SchedulerHandle {
    /// Wait for the next piece among those in `available`.
    /// `None` once the scheduler has stopped.
    pub async fn next_piece(&self, available: Bitfield) -> Option<PieceWork> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(PieceRequest { available, reply }).await.ok()?;
        rx.await.ok()
    }

    /// Give a piece back to the pool. Returns `false` if the scheduler is gone.
    pub async fn recycle(&self, work: PieceWork) -> bool {
        self.returns.send(work).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::PieceProgress;
    use std::time::Duration;

    fn works(indices: &[u32]) -> Vec<PieceWork> {
        indices
            .iter()
            .map(|&i| PieceWork::new(i, [0u8; 20], 16))
            .collect()
    }

    fn everything() -> Bitfield {
        Bitfield::from_peer(vec![0xff; 8], 64).unwrap()
    }

    fn only(indices: &[u32]) -> Bitfield {
        let mut bitfield = Bitfield::with_pieces(64);
        for &index in indices {
            bitfield.set(index).unwrap();
        }
        bitfield
    }

    fn map(indices: &[u32]) -> BTreeMap<u32, ()> {
        indices.iter().map(|&i| (i, ())).collect()
    }

    #[test]
    fn test_find_closest_matches_brute_force() {
        let sets: [&[u32]; 5] = [&[0], &[3, 9], &[0, 1, 2, 3, 4], &[2, 5, 11, 12, 40], &[7, 8, 100]];
        for set in sets {
            let pieces = map(set);
            for target in -3..110i64 {
                let (index, distance) = find_closest(&pieces, target).unwrap();
                let best = set.iter().map(|&i| (i as i64 - target).abs()).min().unwrap();
                assert_eq!(distance, index as i64 - target);
                assert_eq!(distance.abs(), best, "set {:?} target {}", set, target);
            }
        }
    }

    #[test]
    fn test_find_closest_empty_and_extremes() {
        assert_eq!(find_closest(&map(&[]), 4), None);
        assert_eq!(find_closest(&map(&[5, 9]), -10), Some((5, 15)));
        assert_eq!(find_closest(&map(&[5, 9]), i64::MAX), Some((9, 9 - i64::MAX)));
        assert_eq!(find_closest(&map(&[5, 9]), 7), Some((9, 2)));
    }

    #[test]
    fn test_find_closest_where_skips_unwanted_keys() {
        let pieces = map(&[0, 1, 2, 3, 8]);
        assert_eq!(find_closest_where(&pieces, 0, |i| i != 0), Some((1, 1)));
        assert_eq!(find_closest_where(&pieces, 3, |i| i % 2 == 0), Some((2, -1)));
        assert_eq!(find_closest_where(&pieces, 6, |i| i != 3), Some((8, 2)));
        assert_eq!(find_closest_where(&pieces, 2, |_| false), None);
    }

    #[test]
    fn test_take_closest_where_leaves_skipped_pieces() {
        let mut pool = PiecePool::new(works(&[0, 1, 2, 3]), 0);
        assert_eq!(pool.take_closest_where(|i| i >= 2).unwrap().index, 2);
        assert_eq!(pool.closest(), Some(0));
        assert!(pool.take_closest_where(|i| i == 2).is_none());
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_pool_hands_out_nearest_first() {
        let mut pool = PiecePool::new(works(&[0, 1, 2, 3, 4]), 2);
        assert_eq!(pool.take_closest().unwrap().index, 2);
        assert_eq!(pool.len(), 4);

        let next = pool.take_closest().unwrap().index;
        assert!(next == 1 || next == 3);
    }

    #[test]
    fn test_pool_follows_target_updates() {
        let mut pool = PiecePool::new(works(&[0, 1, 2, 3, 4]), 0);
        pool.set_target(4);
        assert_eq!(pool.closest(), Some(4));
        pool.set_target(-1);
        assert_eq!(pool.closest(), Some(0));
    }

    #[test]
    fn test_put_back_keeps_order_without_duplicates() {
        let mut pool = PiecePool::new(works(&[1, 5]), 3);
        let mut returned = PieceWork::new(3, [0u8; 20], 16);
        returned.progress = Some(PieceProgress::new(3, 16, 16));
        pool.put_back(returned);
        pool.put_back(PieceWork::new(3, [0u8; 20], 16));

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.closest(), Some(3));
        assert!(pool.take_closest().unwrap().progress.is_some());
    }

    #[test]
    fn test_drained_pool_advertises_nothing() {
        let mut pool = PiecePool::new(works(&[7]), 0);
        assert!(pool.take_closest().is_some());
        assert!(pool.take_closest().is_none());
        assert_eq!(pool.closest(), None);

        pool.put_back(PieceWork::new(7, [0u8; 20], 16));
        assert_eq!(pool.closest(), Some(7));
    }

    #[tokio::test]
    async fn test_scheduler_offers_around_target() {
        let (_priority_tx, priority_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handle, task) = Scheduler::spawn(works(&[0, 1, 2, 3, 4]), 2, priority_rx, cancel.clone());

        assert_eq!(handle.next_piece(everything()).await.unwrap().index, 2);
        let second = handle.next_piece(everything()).await.unwrap().index;
        assert!(second == 1 || second == 3);

        cancel.cancel();
        task.await.unwrap();
        assert!(handle.next_piece(everything()).await.is_none());
    }

    #[tokio::test]
    async fn test_scheduler_applies_priority_updates_in_order() {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handle, _task) = Scheduler::spawn(works(&[0, 10, 20, 30]), 0, priority_rx, cancel.clone());

        priority_tx.send(30).unwrap();
        priority_tx.send(19).unwrap();
        // updates are drained before the request thanks to the biased select
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.next_piece(everything()).await.unwrap().index, 20);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_parked_request_is_served_by_recycled_piece() {
        let (_priority_tx, priority_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handle, _task) = Scheduler::spawn(works(&[4]), 0, priority_rx, cancel.clone());

        let taken = handle.next_piece(everything()).await.unwrap();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.next_piece(everything()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(handle.recycle(taken).await);
        let again = waiter.await.unwrap().unwrap();
        assert_eq!(again.index, 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_releases_parked_workers() {
        let (_priority_tx, priority_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handle, task) = Scheduler::spawn(Vec::new(), 0, priority_rx, cancel.clone());

        let waiter = tokio::spawn(async move { handle.next_piece(everything()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(waiter.await.unwrap().is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_offers_nearest_piece_the_peer_has() {
        let (_priority_tx, priority_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handle, _task) = Scheduler::spawn(works(&[0, 1, 2, 3, 4, 5, 6, 7]), 0, priority_rx, cancel.clone());

        let partial = only(&[1, 2, 3, 4, 5, 6, 7]);
        for expected in 1..=7 {
            let work = handle.next_piece(partial.clone()).await.unwrap();
            assert_eq!(work.index, expected);
        }
        // piece 0 stays pending for a peer that has it
        assert_eq!(handle.next_piece(only(&[0])).await.unwrap().index, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_parked_request_waits_for_a_piece_it_can_fetch() {
        let (_priority_tx, priority_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handle, _task) = Scheduler::spawn(works(&[0, 5]), 0, priority_rx, cancel.clone());

        let five = handle.next_piece(only(&[5])).await.unwrap();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.next_piece(only(&[5])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(handle.recycle(five).await);
        assert_eq!(waiter.await.unwrap().unwrap().index, 5);
        assert_eq!(handle.next_piece(everything()).await.unwrap().index, 0);
        cancel.cancel();
    }
}
