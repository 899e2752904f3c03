use crossbeam_channel::{Receiver, Sender};
use fxhash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use super::error::MergerError;
use super::hit_block::HitBlock;

/// A physical destination for the merged hit stream.
///
/// Only the merger's coordinator thread ever touches a writer: it is created on that
/// thread and closed on that thread, so writers do not need to be Send.
pub trait HitStreamWriter {
    /// What the writer hands back when it is closed
    type Output: Send + 'static;

    /// Write one complete block
    fn write_block(&mut self, block: &HitBlock) -> Result<(), MergerError>;

    /// Flush and close the stream
    fn close(self) -> Result<Self::Output, MergerError>;
}

/// Counts of what went through the merger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub blocks: usize,
    pub events: usize,
    pub hits: usize,
    pub committed_sinks: usize,
    pub discarded_sinks: usize,
}

enum MergerMessage {
    Block { sink: usize, block: HitBlock },
    Commit { sink: usize },
    Abandon { sink: usize },
}

/// ResultMerger serializes the output of many workers in to a single hit stream.
///
/// Workers each acquire a MergerSink, write their blocks through it and then commit it.
/// Blocks are staged per sink and only given to the writer when the sink commits, so the
/// output only ever contains whole blocks of finished workers. The order in which sinks
/// commit does not matter. A sink which is dropped without committing has its blocks
/// discarded.
pub struct ResultMerger<O> {
    tx: Sender<MergerMessage>,
    next_sink: AtomicUsize,
    coordinator: JoinHandle<Result<(O, MergeSummary), MergerError>>,
}

impl<O: Send + 'static> ResultMerger<O> {
    /// Start the coordinator thread.
    ///
    /// `open` is called on the coordinator thread to create the writer. If it fails, the
    /// error is returned here, before any sink exists.
    pub fn spawn<W, F>(open: F) -> Result<Self, MergerError>
    where
        W: HitStreamWriter<Output = O> + 'static,
        F: FnOnce() -> Result<W, MergerError> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded::<MergerMessage>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), MergerError>>(1);

        let coordinator = std::thread::spawn(move || {
            let writer = match open() {
                Ok(w) => {
                    // The other end only disappears if spawn itself is gone
                    let _ = ready_tx.send(Ok(()));
                    w
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = ready_tx.send(Err(e));
                    return Err(MergerError::Writer(message));
                }
            };
            Self::coordinate(writer, rx)
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx,
                next_sink: AtomicUsize::new(0),
                coordinator,
            }),
            Ok(Err(e)) => {
                let _ = coordinator.join();
                Err(e)
            }
            Err(_) => {
                let _ = coordinator.join();
                Err(MergerError::CoordinatorPanicked)
            }
        }
    }

    /// Get a new sink. Can be called from any thread.
    pub fn acquire_sink(&self) -> MergerSink {
        MergerSink {
            id: self.next_sink.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
            committed: false,
        }
    }

    /// Wait for every outstanding sink to finish, then close the writer.
    ///
    /// All sinks must have been committed or dropped, otherwise this blocks.
    pub fn finish(self) -> Result<(O, MergeSummary), MergerError> {
        drop(self.tx);
        match self.coordinator.join() {
            Ok(result) => result,
            Err(_) => Err(MergerError::CoordinatorPanicked),
        }
    }

    /// The coordinator main loop. Owns the writer.
    fn coordinate<W>(
        mut writer: W,
        rx: Receiver<MergerMessage>,
    ) -> Result<(O, MergeSummary), MergerError>
    where
        W: HitStreamWriter<Output = O>,
    {
        let mut staged: FxHashMap<usize, Vec<HitBlock>> = FxHashMap::default();
        let mut summary = MergeSummary::default();

        while let Ok(message) = rx.recv() {
            match message {
                MergerMessage::Block { sink, block } => {
                    staged.entry(sink).or_default().push(block);
                }
                MergerMessage::Commit { sink } => {
                    for block in staged.remove(&sink).unwrap_or_default() {
                        writer.write_block(&block)?;
                        summary.blocks += 1;
                        summary.events += block.n_events();
                        summary.hits += block.n_hits();
                    }
                    summary.committed_sinks += 1;
                }
                MergerMessage::Abandon { sink } => {
                    if let Some(blocks) = staged.remove(&sink) {
                        log::warn!(
                            "Merger sink {} was dropped without committing; discarding {} block(s)",
                            sink,
                            blocks.len()
                        );
                    }
                    summary.discarded_sinks += 1;
                }
            }
        }

        let output = writer.close()?;
        Ok((output, summary))
    }
}

/// A worker's handle to the merger.
///
/// Each write hands over a whole block, so blocks from different sinks can never
/// interleave.
pub struct MergerSink {
    id: usize,
    tx: Sender<MergerMessage>,
    committed: bool,
}

impl MergerSink {
    /// Hand a block to the merger
    pub fn write(&self, block: HitBlock) -> Result<(), MergerError> {
        self.tx
            .send(MergerMessage::Block {
                sink: self.id,
                block,
            })
            .map_err(|_| MergerError::Disconnected)
    }

    /// Finalize the sink; its blocks become part of the output
    pub fn commit(mut self) -> Result<(), MergerError> {
        self.committed = true;
        self.tx
            .send(MergerMessage::Commit { sink: self.id })
            .map_err(|_| MergerError::Disconnected)
    }
}

impl Drop for MergerSink {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.tx.send(MergerMessage::Abandon { sink: self.id });
        }
    }
}

/// A writer which keeps every block in memory. Handy for tests and small datasets.
#[derive(Debug, Default)]
pub struct MemoryHitStream {
    blocks: Vec<HitBlock>,
}

impl MemoryHitStream {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HitStreamWriter for MemoryHitStream {
    type Output = Vec<HitBlock>;

    fn write_block(&mut self, block: &HitBlock) -> Result<(), MergerError> {
        self.blocks.push(block.clone());
        Ok(())
    }

    fn close(self) -> Result<Self::Output, MergerError> {
        Ok(self.blocks)
    }
}
