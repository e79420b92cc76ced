use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::common::{BrambleError, PageId, Result, PAGE_SIZE};

use super::DiskManager;

/// A queued disk I/O request. The raw pointer stays valid because the
/// submitting call blocks on the completion channel until the worker is
/// done with it.
enum DiskRequest {
    Read {
        page_id: PageId,
        data: *mut u8,
        done: Sender<bool>,
    },
    Write {
        page_id: PageId,
        data: *const u8,
        done: Sender<bool>,
    },
}

// The worker thread is the only other holder of the pointer, and the
// submitter keeps the buffer alive until the completion ack arrives.
unsafe impl Send for DiskRequest {}

/// DiskScheduler funnels page I/O through a single background worker
/// thread fed by a bounded request channel.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    request_tx: Sender<DiskRequest>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (request_tx, request_rx) = bounded::<DiskRequest>(128);
        let shutdown = Arc::new(AtomicBool::new(false));

        let dm = Arc::clone(&disk_manager);
        let stop = Arc::clone(&shutdown);
        let worker = thread::spawn(move || Self::run_worker(dm, request_rx, stop));

        Self {
            disk_manager,
            request_tx,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Reads a page, blocking until the worker has filled the buffer.
    pub fn read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (done_tx, done_rx) = bounded(1);
        self.submit(DiskRequest::Read {
            page_id,
            data: data.as_mut_ptr(),
            done: done_tx,
        })?;
        Self::wait(&done_rx, page_id)
    }

    /// Writes a page, blocking until the worker has persisted it.
    pub fn write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (done_tx, done_rx) = bounded(1);
        self.submit(DiskRequest::Write {
            page_id,
            data: data.as_ptr(),
            done: done_tx,
        })?;
        Self::wait(&done_rx, page_id)
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    fn submit(&self, request: DiskRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .map_err(|e| BrambleError::DiskScheduler(format!("failed to queue request: {e}")))
    }

    fn wait(done: &Receiver<bool>, page_id: PageId) -> Result<()> {
        match done.recv() {
            Ok(true) => Ok(()),
            Ok(false) => Err(BrambleError::DiskScheduler(format!(
                "I/O failed for {page_id}"
            ))),
            Err(e) => Err(BrambleError::DiskScheduler(format!(
                "completion channel closed: {e}"
            ))),
        }
    }

    fn run_worker(
        disk_manager: Arc<DiskManager>,
        requests: Receiver<DiskRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                // Drain what was queued before the shutdown flag was set
                while let Ok(request) = requests.try_recv() {
                    Self::process(&disk_manager, request);
                }
                break;
            }

            match requests.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => Self::process(&disk_manager, request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read {
                page_id,
                data,
                done,
            } => {
                // The submitter is blocked on `done`, keeping the buffer alive.
                let buf = unsafe { std::slice::from_raw_parts_mut(data, PAGE_SIZE) };
                let ok = disk_manager.read_page(page_id, buf).is_ok();
                let _ = done.send(ok);
            }
            DiskRequest::Write {
                page_id,
                data,
                done,
            } => {
                // The submitter is blocked on `done`, keeping the buffer alive.
                let buf = unsafe { std::slice::from_raw_parts(data, PAGE_SIZE) };
                let ok = disk_manager.write_page(page_id, buf).is_ok();
                let _ = done.send(ok);
            }
        }
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
