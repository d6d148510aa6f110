//! Command Driver
//!
//! One-shot sends and the repeating loops behind held inputs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::domain::state::CarState;
use crate::infrastructure::bluetooth::connection::Connection;
use crate::infrastructure::bluetooth::protocol::{CarCommand, CommandClass};
use crate::infrastructure::bluetooth::transport::Transport;

pub type SharedConnection<T> = Arc<Mutex<Connection<T>>>;

/// Writes commands to the current session
pub struct CommandSink<T: Transport> {
    connection: SharedConnection<T>,
    state: Arc<CarState>,
}

impl<T: Transport> Clone for CommandSink<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Transport> CommandSink<T> {
    pub fn new(connection: SharedConnection<T>, state: Arc<CarState>) -> Self {
        Self { connection, state }
    }

    /// Write one command. False when there is no session or the write fails;
    /// a failed write tears the session down.
    pub async fn send(&self, command: CarCommand) -> bool {
        let mut connection = self.connection.lock().await;
        if !connection.is_open() {
            trace!("Not connected, dropping {}", command);
            return false;
        }

        match connection.write(&command.as_bytes()).await {
            Ok(()) => {
                trace!("Sent {}", command);
                true
            }
            Err(e) => {
                error!("Failed to send {}: {}", command, e);
                connection.close().await;
                self.state.is_connected.set(false);
                self.state
                    .last_error
                    .set(Some(format!("Failed to send command: {}", e)));
                false
            }
        }
    }
}

struct CommandLoop {
    command: CarCommand,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CommandLoop {
    /// Cancel and wait until the last write has finished
    async fn halt(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub struct CommandDriver<T: Transport> {
    sink: CommandSink<T>,
    interval: Duration,
    loops: Mutex<HashMap<CommandClass, CommandLoop>>,
}

impl<T: Transport> CommandDriver<T> {
    pub fn new(sink: CommandSink<T>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send(&self, command: CarCommand) -> bool {
        self.sink.send(command).await
    }

    /// Repeat `command` until stopped. A running loop of the same class is
    /// replaced without sending its release.
    pub async fn start(&self, class: CommandClass, command: CarCommand) {
        let mut loops = self.loops.lock().await;
        if let Some(previous) = loops.remove(&class) {
            debug!("{} supersedes {}", command, previous.command);
            previous.halt().await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(repeat(
            self.sink.clone(),
            command,
            self.interval,
            cancel.clone(),
        ));
        loops.insert(
            class,
            CommandLoop {
                command,
                cancel,
                task,
            },
        );
    }

    /// Halt the loop of `class`, then send its release token once.
    /// The loop table stays locked until the release is written, so a
    /// concurrent `start` of the class only begins after it.
    pub async fn stop(&self, class: CommandClass) -> bool {
        let mut loops = self.loops.lock().await;
        if let Some(running) = loops.remove(&class) {
            running.halt().await;
        }
        self.sink.send(class.release()).await
    }

    /// Halt every loop without sending releases
    pub async fn cancel_all(&self) {
        let running: Vec<CommandLoop> = self.loops.lock().await.drain().map(|(_, l)| l).collect();
        for running in running {
            running.halt().await;
        }
    }

    pub async fn running(&self, class: CommandClass) -> Option<CarCommand> {
        self.loops.lock().await.get(&class).map(|l| l.command)
    }
}

async fn repeat<T: Transport>(
    sink: CommandSink<T>,
    command: CarCommand,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        sink.send(command).await;
    }
    trace!("Loop for {} finished", command);
}
