// 固定大小的工作线程池，每个任务在独立线程上运行
use crate::utils::error::{FleetError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread;
use tracing::error;

pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Job>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl ThreadPool {
    pub fn new(size: usize) -> ThreadPool {
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            workers.push(Worker::new(id, receiver.clone()));
        }

        ThreadPool {
            workers,
            sender: Some(sender),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(FleetError::ThreadJoinError)?;
        sender.send(Box::new(f)).map_err(|_| FleetError::ThreadJoinError)
    }

    /// 关闭任务队列并等待所有线程退出
    pub fn join(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        drop(self.sender.take());

        let mut result = Ok(());
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!(worker = worker.id, "Worker thread panicked");
                    result = Err(FleetError::ThreadJoinError);
                }
            }
        }
        result
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown().ok();
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Receiver<Job>) -> Worker {
        let thread = thread::Builder::new()
            .name(format!("fleet-worker-{}", id))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .ok();

        if thread.is_none() {
            error!(worker = id, "Failed to spawn worker thread");
        }

        Worker { id, thread }
    }
}
