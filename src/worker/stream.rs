use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Read;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::Response;
use crate::envexec::{File, FileStreamIn, FileStreamOut};

const READ_CHUNK: usize = 32 * 1024;

/// Update from a running streaming session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk read from the stream output `name`
    Output { name: String, content: Vec<u8> },
    /// Final response, always the last event
    Finished(Response),
}

/// Handle on a request started with [`Worker::stream`](super::Worker::stream)
pub struct StreamSession {
    inputs: HashMap<String, FileStreamIn>,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamSession {
    pub(crate) fn new(
        inputs: HashMap<String, FileStreamIn>,
        events: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inputs,
            events,
            cancel,
        }
    }

    /// Input declared as `stream_in` under `name`
    pub fn input(&self, name: &str) -> Option<FileStreamIn> {
        self.inputs.get(name).cloned()
    }

    /// Next event, `None` once the finished event was taken
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Kills the running commands, the session still ends with `Finished`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Stream handles created while binding the files of one request
#[derive(Default)]
pub(crate) struct Streams {
    pub inputs: HashMap<String, FileStreamIn>,
    pub outputs: Vec<(String, FileStreamOut)>,
}

impl Streams {
    pub fn stream_in(&mut self, name: String) -> Result<File> {
        match self.inputs.entry(name) {
            Entry::Occupied(e) => bail!("duplicate stream_in {}", e.key()),
            Entry::Vacant(e) => Ok(File::StreamIn(e.insert(FileStreamIn::new()).clone())),
        }
    }

    pub fn stream_out(&mut self, name: String) -> Result<File> {
        if self.outputs.iter().any(|(n, _)| *n == name) {
            bail!("duplicate stream_out {name}");
        }
        let out = FileStreamOut::new();
        self.outputs.push((name, out.clone()));
        Ok(File::StreamOut(out))
    }

    /// Starts one reader per output forwarding chunks as events
    pub fn spawn_readers(&self, events: &mpsc::Sender<StreamEvent>) -> Vec<JoinHandle<()>> {
        self.outputs
            .iter()
            .map(|(name, out)| {
                let (name, mut out, events) = (name.clone(), out.clone(), events.clone());
                tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; READ_CHUNK];
                    loop {
                        let n = match out.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => n,
                            Err(e) => {
                                log::debug!("stream {name} read failed: {e}");
                                break;
                            }
                        };
                        let event = StreamEvent::Output {
                            name: name.clone(),
                            content: buf[..n].to_vec(),
                        };
                        if events.blocking_send(event).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect()
    }

    /// Releases handles whose command never started
    pub fn abandon(&self) {
        for input in self.inputs.values() {
            input.abandon();
        }
        for (_, out) in &self.outputs {
            out.abandon();
        }
    }
}
