use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use glam::Mat4;

use super::{DistanceSorter, Distances, SortParams, SorterConfig};

/// Owned depths passed with a sort job.
#[derive(Debug, Clone)]
pub enum OwnedDistances {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

#[derive(Debug, Clone)]
pub struct SortJob {
    pub view_proj: Mat4,
    pub indexes_to_sort: Vec<u32>,
    pub render_count: usize,
    pub sort_count: usize,
    pub precomputed: Option<OwnedDistances>,
}

#[derive(Debug, Clone)]
pub enum SortRequest {
    Init(SorterConfig),
    /// Four components per splat, with optional per-splat scene indexes.
    UploadCenters { centers: Vec<f32>, scene_indexes: Option<Vec<u32>> },
    UploadTransforms(Vec<Mat4>),
    Sort(SortJob),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortReply {
    SetupComplete,
    SortDone { sorted_indexes: Vec<u32>, render_count: usize, sort_count: usize, sort_time_ms: f64 },
    Failed { message: String, during_sort: bool },
}

type Tagged<T> = (u64, T);

/// Handle to a background sorting thread. At most one sort is in flight;
/// later jobs wait in a queue and are dispatched as replies arrive.
pub struct SortWorker {
    requests: Sender<Tagged<SortRequest>>,
    replies: Receiver<Tagged<SortReply>>,
    handle: Option<JoinHandle<()>>,
    generation: u64,
    in_flight: bool,
    queued: VecDeque<SortJob>,
}

impl SortWorker {
    pub fn spawn() -> anyhow::Result<Self> {
        let (requests, request_rx) = crossbeam_channel::unbounded();
        let (reply_tx, replies) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("ksplat-sort".to_string())
            .spawn(move || run(request_rx, reply_tx))?;
        Ok(Self { requests, replies, handle: Some(handle), generation: 0, in_flight: false, queued: VecDeque::new() })
    }

    pub fn init(&mut self, config: SorterConfig) -> anyhow::Result<()> {
        self.send(SortRequest::Init(config))
    }

    pub fn upload_centers(&mut self, centers: Vec<f32>, scene_indexes: Option<Vec<u32>>) -> anyhow::Result<()> {
        self.send(SortRequest::UploadCenters { centers, scene_indexes })
    }

    pub fn upload_transforms(&mut self, transforms: Vec<Mat4>) -> anyhow::Result<()> {
        self.send(SortRequest::UploadTransforms(transforms))
    }

    pub fn request_sort(&mut self, job: SortJob) -> anyhow::Result<()> {
        if self.in_flight {
            self.queued.push_back(job);
            return Ok(());
        }
        self.in_flight = true;
        self.send(SortRequest::Sort(job))
    }

    pub fn is_sort_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn queued_sorts(&self) -> usize {
        self.queued.len()
    }

    /// Drop queued jobs and ignore the reply of any sort already running.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.queued.clear();
    }

    /// Non-blocking check for a reply.
    pub fn poll(&mut self) -> anyhow::Result<Option<SortReply>> {
        loop {
            match self.replies.try_recv() {
                Ok(tagged) => {
                    if let Some(reply) = self.accept(tagged)? {
                        return Ok(Some(reply));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(anyhow!("Sort worker exited")),
            }
        }
    }

    /// Block up to `timeout` for a reply.
    pub fn wait(&mut self, timeout: Duration) -> anyhow::Result<Option<SortReply>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.replies.recv_deadline(deadline) {
                Ok(tagged) => {
                    if let Some(reply) = self.accept(tagged)? {
                        return Ok(Some(reply));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(anyhow!("Sort worker exited")),
            }
        }
    }

    fn send(&self, request: SortRequest) -> anyhow::Result<()> {
        self.requests
            .send((self.generation, request))
            .map_err(|_| anyhow!("Sort worker exited"))
    }

    fn accept(&mut self, (generation, reply): Tagged<SortReply>) -> anyhow::Result<Option<SortReply>> {
        let sort_finished = matches!(reply, SortReply::SortDone { .. } | SortReply::Failed { during_sort: true, .. });
        if sort_finished {
            self.in_flight = false;
            if let Some(job) = self.queued.pop_front() {
                self.in_flight = true;
                self.send(SortRequest::Sort(job))?;
            }
        }
        if sort_finished && generation < self.generation {
            log::debug!("Discarding stale sort reply");
            return Ok(None);
        }
        Ok(Some(reply))
    }
}

impl Drop for SortWorker {
    fn drop(&mut self) {
        let _ = self.requests.send((self.generation, SortRequest::Shutdown));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(requests: Receiver<Tagged<SortRequest>>, replies: Sender<Tagged<SortReply>>) {
    let mut sorter: Option<DistanceSorter> = None;
    while let Ok((generation, request)) = requests.recv() {
        let during_sort = matches!(request, SortRequest::Sort(_));
        let reply = match handle_request(&mut sorter, request) {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(err) if err.is::<Shutdown>() => break,
            Err(err) => {
                log::warn!("Sort worker request failed: {err}");
                SortReply::Failed { message: err.to_string(), during_sort }
            }
        };
        if replies.send((generation, reply)).is_err() {
            break;
        }
    }
    log::debug!("Sort worker stopped");
}

#[derive(Debug, thiserror::Error)]
#[error("shutdown")]
struct Shutdown;

fn ready(sorter: &mut Option<DistanceSorter>) -> anyhow::Result<&mut DistanceSorter> {
    sorter.as_mut().ok_or_else(|| anyhow!("Sorter not initialized"))
}

fn handle_request(sorter: &mut Option<DistanceSorter>, request: SortRequest) -> anyhow::Result<Option<SortReply>> {
    match request {
        SortRequest::Init(config) => {
            *sorter = Some(DistanceSorter::new(config)?);
            Ok(Some(SortReply::SetupComplete))
        }
        SortRequest::UploadCenters { centers, scene_indexes } => {
            let sorter = ready(sorter)?;
            sorter.set_centers(&centers, 4)?;
            if let Some(scene_indexes) = scene_indexes {
                sorter.set_scene_indexes(&scene_indexes);
            }
            Ok(None)
        }
        SortRequest::UploadTransforms(transforms) => {
            ready(sorter)?.set_transforms(&transforms);
            Ok(None)
        }
        SortRequest::Sort(job) => {
            let sorter = ready(sorter)?;
            let start = Instant::now();
            let precomputed = job.precomputed.as_ref().map(|d| match d {
                OwnedDistances::Float(d) => Distances::Float(d),
                OwnedDistances::Int(d) => Distances::Int(d),
            });
            let params = SortParams {
                view_proj: job.view_proj,
                indexes_to_sort: &job.indexes_to_sort,
                render_count: job.render_count,
                sort_count: job.sort_count,
                precomputed,
            };
            let sorted_indexes = sorter.sort(&params)?.to_vec();
            Ok(Some(SortReply::SortDone {
                sorted_indexes,
                render_count: job.render_count,
                sort_count: job.sort_count.min(job.render_count),
                sort_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            }))
        }
        SortRequest::Shutdown => Err(Shutdown.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn job(render_count: usize) -> SortJob {
        SortJob {
            view_proj: Mat4::IDENTITY,
            indexes_to_sort: (0..render_count as u32).collect(),
            render_count,
            sort_count: render_count,
            precomputed: None,
        }
    }

    fn ready_worker() -> SortWorker {
        let mut worker = SortWorker::spawn().unwrap();
        worker.init(SorterConfig { max_splat_count: 5, ..Default::default() }).unwrap();
        assert_eq!(worker.wait(TIMEOUT).unwrap(), Some(SortReply::SetupComplete));
        let centers = [5.0, 1.0, 3.0, 2.0, 4.0].iter().flat_map(|z| [0.0, 0.0, *z, 1.0]).collect();
        worker.upload_centers(centers, None).unwrap();
        worker
    }

    #[test]
    fn test_sort_round_trip() {
        let mut worker = ready_worker();
        worker.request_sort(job(5)).unwrap();
        assert!(worker.is_sort_in_flight());
        match worker.wait(TIMEOUT).unwrap() {
            Some(SortReply::SortDone { sorted_indexes, render_count, sort_count, .. }) => {
                assert_eq!(sorted_indexes, vec![1, 3, 2, 4, 0]);
                assert_eq!((render_count, sort_count), (5, 5));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(!worker.is_sort_in_flight());
    }

    #[test]
    fn test_requests_queue_behind_in_flight_sort() {
        let mut worker = ready_worker();
        worker.request_sort(job(5)).unwrap();
        worker.request_sort(job(3)).unwrap();
        assert_eq!(worker.queued_sorts(), 1);
        let mut render_counts = Vec::new();
        while let Some(reply) = worker.wait(TIMEOUT).unwrap() {
            if let SortReply::SortDone { render_count, .. } = reply {
                render_counts.push(render_count);
            }
            if render_counts.len() == 2 {
                break;
            }
        }
        assert_eq!(render_counts, vec![5, 3]);
    }

    #[test]
    fn test_cancel_discards_replies() {
        let mut worker = ready_worker();
        worker.request_sort(job(5)).unwrap();
        worker.request_sort(job(4)).unwrap();
        worker.cancel();
        assert_eq!(worker.queued_sorts(), 0);
        assert_eq!(worker.wait(Duration::from_millis(200)).unwrap(), None);
        assert!(!worker.is_sort_in_flight());
    }

    #[test]
    fn test_failures_are_reported() {
        let mut worker = SortWorker::spawn().unwrap();
        worker.request_sort(job(2)).unwrap();
        match worker.wait(TIMEOUT).unwrap() {
            Some(SortReply::Failed { during_sort, .. }) => assert!(during_sort),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(!worker.is_sort_in_flight());
    }
}
