use std::io;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

/// A device handler owned by a dedicated blocking I/O thread.
///
/// Commands are executed as they arrive; between commands the executor
/// calls [`IoHandler::poll`] so the handler can drain its device stream
/// at its own cadence, independent of command traffic.
pub trait IoHandler: Send {
    type Command: Send + 'static;
    type Response: Send + 'static;

    fn execute(&mut self, command: Self::Command) -> io::Result<Self::Response>;

    /// Drain whatever the device has produced since the last call.
    /// Must not block longer than the handler's own read timeout.
    fn poll(&mut self);

    /// How long to wait for the next command before polling again.
    fn poll_interval(&self) -> Duration;
}

struct Envelope<H: IoHandler> {
    command: H::Command,
    response_ch: oneshot::Sender<io::Result<H::Response>>,
}

pub struct IoExecutor<H: IoHandler> {
    handler: H,
    commands_ch: Receiver<Envelope<H>>,
}

impl<H: IoHandler + 'static> IoExecutor<H> {
    pub fn channel(handler: H) -> (Self, IoSender<H>) {
        let (sender, commands_ch) = std::sync::mpsc::channel();

        (
            Self {
                handler,
                commands_ch,
            },
            IoSender {
                commands_ch: sender,
            },
        )
    }

    /// Runs until every [`IoSender`] handle has been dropped.
    pub fn run(mut self) {
        loop {
            match self.commands_ch.recv_timeout(self.handler.poll_interval()) {
                Ok(envelope) => {
                    self.dispatch(envelope);
                    // Drain anything else already queued before the
                    // next poll so commands never pile up behind it.
                    while let Ok(envelope) = self.commands_ch.try_recv() {
                        self.dispatch(envelope);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.handler.poll();
        }
    }

    fn dispatch(&mut self, envelope: Envelope<H>) {
        let result = self.handler.execute(envelope.command);
        if envelope.response_ch.send(result).is_err() {
            warn!("command reply receiver dropped");
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

pub struct IoSender<H: IoHandler> {
    commands_ch: Sender<Envelope<H>>,
}

impl<H: IoHandler> Clone for IoSender<H> {
    fn clone(&self) -> Self {
        Self {
            commands_ch: self.commands_ch.clone(),
        }
    }
}

impl<H: IoHandler> IoSender<H> {
    pub async fn send(&self, command: H::Command) -> io::Result<H::Response> {
        let (response_ch, response_rx) = oneshot::channel();

        self.commands_ch
            .send(Envelope {
                command,
                response_ch,
            })
            .map_err(|_| io::Error::other("I/O executor has shut down"))?;

        response_rx
            .await
            .map_err(|_| io::Error::other("I/O executor dropped the command"))?
    }
}
