//! MCU link: a dedicated I/O thread owns the byte channel, writes
//! command frames on demand and continuously drains telemetry into a
//! single-writer snapshot that the control side reads without locking.

use std::io::{self, Read, Write};
use std::time::Duration;

use mcu::{AxisPosition, CommandFrame, TelemetryBuffer, DATA_INTERVAL_MS, MSG_LENGTH};
use tokio::sync::watch;
use tracing::{debug, warn};
use utilities::io_executor::{IoExecutor, IoHandler, IoSender};

use crate::error::ControllerError;

/// Externally observable transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No telemetry yet, or reconnect attempts are exhausted.
    Disconnected,
    /// Telemetry stopped arriving; the channel is retrying.
    Reconnecting,
    /// Aligned telemetry is flowing.
    Synced,
}

/// Snapshot published by the I/O thread after each telemetry drain.
#[derive(Debug, Clone, Copy)]
pub struct LinkSnapshot {
    pub status: LinkStatus,
    pub position: AxisPosition,
    pub motion_complete: bool,
    /// Total records decoded since the link came up; lets readers tell
    /// fresh telemetry from a stale snapshot.
    pub records_seen: u64,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            position: AxisPosition::default(),
            motion_complete: false,
            records_seen: 0,
        }
    }
}

#[derive(Debug)]
pub enum LinkCommand {
    Send(CommandFrame),
}

pub struct McuIoHandler<C> {
    channel: C,
    telemetry: TelemetryBuffer,
    state_tx: watch::Sender<LinkSnapshot>,
    read_buf: Box<[u8; MSG_LENGTH]>,
    poll_interval: Duration,
    read_failures: u32,
    max_read_failures: u32,
}

impl<C: Read + Write + Send> McuIoHandler<C> {
    fn new(
        channel: C,
        state_tx: watch::Sender<LinkSnapshot>,
        poll_interval: Duration,
        max_read_failures: u32,
    ) -> Self {
        Self {
            channel,
            telemetry: TelemetryBuffer::new(),
            state_tx,
            read_buf: Box::new([0u8; MSG_LENGTH]),
            poll_interval,
            read_failures: 0,
            max_read_failures,
        }
    }

    fn note_failure(&mut self, error: &io::Error) {
        self.read_failures = self.read_failures.saturating_add(1);
        self.telemetry.mark_lost();

        let status = if self.read_failures > self.max_read_failures {
            LinkStatus::Disconnected
        } else {
            LinkStatus::Reconnecting
        };

        if status == LinkStatus::Disconnected {
            warn!(failures = self.read_failures, "MCU link lost: {}", error);
        } else {
            debug!(failures = self.read_failures, "telemetry read failed: {}", error);
        }

        self.state_tx.send_modify(|snapshot| snapshot.status = status);
    }
}

impl<C: Read + Write + Send> IoHandler for McuIoHandler<C> {
    type Command = LinkCommand;
    type Response = ();

    fn execute(&mut self, command: LinkCommand) -> io::Result<()> {
        match command {
            LinkCommand::Send(frame) => {
                self.channel.write_all(&frame.encode())?;
                self.channel.flush()
            }
        }
    }

    fn poll(&mut self) {
        match self.channel.read(&mut self.read_buf[..]) {
            Ok(0) => self.note_failure(&io::Error::other("connection closed by peer")),
            Ok(n) => {
                self.read_failures = 0;
                self.telemetry.extend(&self.read_buf[..n]);

                let records = self.telemetry.drain_records();
                if let Some(last) = records.last() {
                    self.state_tx.send_modify(|snapshot| {
                        snapshot.status = LinkStatus::Synced;
                        snapshot.position = last.position;
                        snapshot.motion_complete = last.motion_complete;
                        snapshot.records_seen += records.len() as u64;
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                // No telemetry this tick.
            }
            Err(e) => self.note_failure(&e),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Tuning for the link's I/O thread. The defaults follow the MCU's
/// 250 ms update cadence.
#[derive(Debug, Clone, Copy)]
pub struct LinkTuning {
    pub poll_interval: Duration,
    pub max_read_failures: u32,
}

impl Default for LinkTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DATA_INTERVAL_MS),
            max_read_failures: 8,
        }
    }
}

/// Async handle to the MCU I/O thread. Cloneable; every clone shares
/// the same command queue and snapshot channel.
pub struct McuLink<C: Read + Write + Send + 'static> {
    sender: IoSender<McuIoHandler<C>>,
    state_rx: watch::Receiver<LinkSnapshot>,
}

impl<C: Read + Write + Send + 'static> Clone for McuLink<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            state_rx: self.state_rx.clone(),
        }
    }
}

impl<C: Read + Write + Send + 'static> McuLink<C> {
    pub fn connect(channel: C, tuning: LinkTuning) -> (Self, tokio::task::JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(LinkSnapshot::default());
        let handler = McuIoHandler::new(
            channel,
            state_tx,
            tuning.poll_interval,
            tuning.max_read_failures,
        );

        let (executor, sender) = IoExecutor::channel(handler);
        let task = executor.spawn();

        (Self { sender, state_rx }, task)
    }

    /// Writes exactly one command frame. A failed or short write
    /// surfaces as [`ControllerError::LinkWrite`]; nothing is retried
    /// implicitly.
    pub async fn send_frame(&self, frame: CommandFrame) -> Result<(), ControllerError> {
        self.sender
            .send(LinkCommand::Send(frame))
            .await
            .map_err(|source| ControllerError::LinkWrite { source })
    }

    /// Non-blocking snapshot of the latest telemetry.
    pub fn latest(&self) -> LinkSnapshot {
        *self.state_rx.borrow()
    }

    pub fn status(&self) -> LinkStatus {
        self.latest().status
    }

    pub fn is_motion_complete(&self) -> bool {
        self.latest().motion_complete
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.state_rx.clone()
    }

    /// Waits until aligned telemetry is flowing.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), ControllerError> {
        let mut rx = self.state_rx.clone();

        let wait = async {
            loop {
                if rx.borrow().status == LinkStatus::Synced {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ControllerError::LinkDisconnected);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ControllerError::LinkDisconnected)?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-in for the MCU end of the byte channel.

    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    use mcu::{AxisPosition, CommandFrame, Opcode, TelemetryRecord, TIMEPOINT_PER_UPDATE};

    #[derive(Default)]
    pub struct SimState {
        pub position: AxisPosition,
        target: AxisPosition,
        tick: u8,
        pub written_frames: Vec<CommandFrame>,
        write_buf: Vec<u8>,
        pending: VecDeque<u8>,
        /// When set, the simulated stage never reports completion.
        pub stall: bool,
        /// When set, every read fails as if the peer vanished.
        pub broken: bool,
        /// When set, only writes fail; telemetry keeps flowing.
        pub write_broken: bool,
    }

    /// Byte channel that behaves like the MCU: acknowledges command
    /// frames by moving a simulated stage and answers every read with
    /// a full 500-byte update message.
    #[derive(Clone, Default)]
    pub struct McuSimulator {
        pub state: Arc<Mutex<SimState>>,
    }

    impl McuSimulator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn written_frames(&self) -> Vec<CommandFrame> {
            self.state.lock().unwrap().written_frames.clone()
        }

        pub fn set_broken(&self, broken: bool) {
            self.state.lock().unwrap().broken = broken;
        }

        pub fn set_write_broken(&self, broken: bool) {
            self.state.lock().unwrap().write_broken = broken;
        }

        pub fn set_stall(&self, stall: bool) {
            self.state.lock().unwrap().stall = stall;
        }

        pub fn position(&self) -> AxisPosition {
            self.state.lock().unwrap().position
        }
    }

    impl Read for McuSimulator {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.broken {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "simulated link loss",
                ));
            }

            if state.pending.is_empty() {
                // Produce the next update: a few records in motion,
                // the rest settled at the target.
                let moving = state.position != state.target && !state.stall;
                for index in 0..TIMEPOINT_PER_UPDATE {
                    if moving && index == 10 {
                        state.position = state.target;
                    }

                    let record = TelemetryRecord {
                        tick: state.tick,
                        motion_complete: state.position == state.target && !state.stall,
                        position: state.position,
                    };
                    state.tick = (state.tick + 1) % 16;
                    state.pending.extend(record.encode());
                }
            }

            let n = buf.len().min(state.pending.len());
            for byte in buf.iter_mut().take(n) {
                *byte = state.pending.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for McuSimulator {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.broken || state.write_broken {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "simulated link loss",
                ));
            }

            state.write_buf.extend_from_slice(buf);
            while state.write_buf.len() >= mcu::CMD_LENGTH {
                let frame_bytes: Vec<u8> = state.write_buf.drain(..mcu::CMD_LENGTH).collect();
                let frame = CommandFrame::decode(&frame_bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

                match frame.opcode {
                    Opcode::Move => state.target.set(frame.axis, frame.steps),
                    Opcode::Home => state.target.set(frame.axis, 0),
                    Opcode::Stop => {
                        let held = state.position;
                        state.target = held;
                    }
                }
                state.written_frames.push(frame);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn fast_tuning() -> super::LinkTuning {
        super::LinkTuning {
            poll_interval: std::time::Duration::from_millis(2),
            max_read_failures: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fast_tuning, McuSimulator};
    use super::*;
    use mcu::Axis;

    #[tokio::test]
    async fn link_syncs_and_publishes_positions() {
        let sim = McuSimulator::new();
        let (link, _io) = McuLink::connect(sim.clone(), fast_tuning());

        link.wait_synced(Duration::from_secs(1)).await.unwrap();
        assert_eq!(link.status(), LinkStatus::Synced);
        assert!(link.is_motion_complete());
        assert!(link.latest().records_seen > 0);
    }

    #[tokio::test]
    async fn sent_frames_reach_the_wire_whole() {
        let sim = McuSimulator::new();
        let (link, _io) = McuLink::connect(sim.clone(), fast_tuning());
        link.wait_synced(Duration::from_secs(1)).await.unwrap();

        let frame = CommandFrame::move_to(Axis::Y, 4242).unwrap();
        link.send_frame(frame).await.unwrap();

        assert_eq!(sim.written_frames(), vec![frame]);
    }

    #[tokio::test]
    async fn link_loss_is_observable_as_disconnected() {
        let sim = McuSimulator::new();
        let (link, _io) = McuLink::connect(sim.clone(), fast_tuning());
        link.wait_synced(Duration::from_secs(1)).await.unwrap();

        sim.set_broken(true);

        let mut rx = link.subscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while rx.borrow_and_update().status != LinkStatus::Disconnected {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("link should report the loss");
    }
}
