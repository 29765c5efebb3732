use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::thread::JoinHandle;

type WriteJob = Box<dyn FnOnce() + Send + 'static>;

/// The store's dedicated serial writer thread.
///
/// Jobs run one at a time in submission order. Dropping the writer closes
/// the channel; the thread finishes queued jobs and exits.
pub(crate) struct SerialWriter {
    tx: mpsc::Sender<WriteJob>,
    _thread: JoinHandle<()>,
}

impl SerialWriter {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("Write job panicked; writer continues with the next job");
                    }
                }
                log::debug!("Serial writer exiting");
            })?;
        Ok(SerialWriter {
            tx,
            _thread: thread,
        })
    }

    /// Queue a job. Returns false if the writer thread has gone away.
    pub fn submit(&self, job: WriteJob) -> bool {
        self.tx.send(job).is_ok()
    }
}
