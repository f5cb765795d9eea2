//! The two unidirectional queues between the host and the media sandbox.
//!
//! Each direction delivers in send order. Nothing orders one direction
//! against the other. Payloads travel as envelope JSON text; receivers decode
//! and drop anything malformed with a warning.

use tokio::sync::mpsc;

use crate::codec::{Command, Event, Message, from_wire, to_wire};
use crate::errors::CallError;

/// Host side of a channel pair.
pub struct HostPort {
    pub commands: CommandSender,
    pub events: EventReceiver,
}

/// Sandbox side of a channel pair.
pub struct SandboxPort {
    pub commands: CommandReceiver,
    pub events: EventSender,
}

pub fn pair() -> (HostPort, SandboxPort) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        HostPort {
            commands: CommandSender(command_tx),
            events: EventReceiver(event_rx),
        },
        SandboxPort {
            commands: CommandReceiver(command_rx),
            events: EventSender(event_tx),
        },
    )
}

#[derive(Debug, Clone)]
pub struct CommandSender(mpsc::UnboundedSender<String>);

impl CommandSender {
    pub fn send(&self, command: &Command) -> Result<(), CallError> {
        tracing::debug!(command = command.kind(), "-> sandbox");
        self.0.send(to_wire(command)).map_err(|_| CallError::ChannelClosed)
    }

    /// Push raw envelope text, bypassing the encoder.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), CallError> {
        self.0.send(text.into()).map_err(|_| CallError::ChannelClosed)
    }
}

#[derive(Debug)]
pub struct CommandReceiver(mpsc::UnboundedReceiver<String>);

impl CommandReceiver {
    /// Next well-formed command, or `None` once the host side is gone.
    pub async fn recv(&mut self) -> Option<Command> {
        while let Some(text) = self.0.recv().await {
            if let Some(command) = decode_or_drop::<Command>(&text) {
                return Some(command);
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<String>);

impl EventSender {
    pub fn emit(&self, event: &Event) {
        tracing::debug!(event = event.kind(), "<- sandbox");
        if self.0.send(to_wire(event)).is_err() {
            tracing::debug!(event = event.kind(), "event dropped: host side is gone");
        }
    }

    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), CallError> {
        self.0.send(text.into()).map_err(|_| CallError::ChannelClosed)
    }
}

#[derive(Debug)]
pub struct EventReceiver(mpsc::UnboundedReceiver<String>);

impl EventReceiver {
    /// Next well-formed event, or `None` once the sandbox side is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        while let Some(text) = self.0.recv().await {
            if let Some(event) = decode_or_drop::<Event>(&text) {
                return Some(event);
            }
        }
        None
    }

    /// Next well-formed event that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        while let Ok(text) = self.0.try_recv() {
            if let Some(event) = decode_or_drop::<Event>(&text) {
                return Some(event);
            }
        }
        None
    }
}

fn decode_or_drop<M: Message>(text: &str) -> Option<M> {
    match from_wire::<M>(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("dropping envelope: {e}");
            None
        }
    }
}
