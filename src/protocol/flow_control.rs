//! Tor SENDME Flow Control
//!
//! Implements Tor's windowed flow control for circuits and streams.
//!
//! ## How It Works:
//!
//! 1. **Package window:** cells we may still send before the peer acks
//! 2. **Deliver window:** cells we may still receive before we must ack
//! 3. **SENDME:** once the deliver window drops one increment below its
//!    start value, we add the increment back and send a SENDME
//! 4. **Increment:** a SENDME from the peer adds one increment to the
//!    package window
//!
//! ## Window Values (Tor protocol):
//!
//! - **Circuit:** start 1000 cells, increment 100
//! - **Stream:** start 500 cells, increment 50
//!
//! A window never exceeds its start value. A SENDME that would push the
//! package window past it is a protocol violation, and an empty package
//! window refuses further sends.

use crate::error::{Result, TorError};

/// Package/deliver windows for one circuit hop or one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Cells we can send before needing SENDME
    pub package_window: u16,

    /// Cells we can receive before sending SENDME
    pub deliver_window: u16,

    start: u16,
    increment: u16,
}

impl FlowControl {
    /// Initial circuit window size (1000 cells)
    pub const CIRCUIT_WINDOW_START: u16 = 1000;

    /// Circuit window increment per SENDME (100 cells)
    pub const CIRCUIT_WINDOW_INCREMENT: u16 = 100;

    /// Initial stream window size (500 cells)
    pub const STREAM_WINDOW_START: u16 = 500;

    /// Stream window increment per SENDME (50 cells)
    pub const STREAM_WINDOW_INCREMENT: u16 = 50;

    /// Windows with an arbitrary start and an increment no larger than it
    fn new(start: u16, increment: u16) -> Self {
        debug_assert!(increment <= start);
        Self {
            package_window: start,
            deliver_window: start,
            start,
            increment,
        }
    }

    /// Windows for one circuit hop
    pub fn circuit() -> Self {
        Self::new(Self::CIRCUIT_WINDOW_START, Self::CIRCUIT_WINDOW_INCREMENT)
    }

    /// Windows for one stream
    pub fn stream() -> Self {
        Self::new(Self::STREAM_WINDOW_START, Self::STREAM_WINDOW_INCREMENT)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn increment(&self) -> u16 {
        self.increment
    }

    /// Check if we can send a cell
    pub fn can_send(&self) -> bool {
        self.package_window > 0
    }

    /// Decrement package window when sending a DATA cell
    pub fn on_send(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(TorError::WindowExhausted(format!(
                "package window empty (start {})",
                self.start
            )));
        }

        self.package_window -= 1;
        Ok(())
    }

    /// Give back a slot taken by [`FlowControl::on_send`] for a cell that
    /// was never sent
    pub fn refund_send(&mut self) {
        if self.package_window < self.start {
            self.package_window += 1;
        }
    }

    /// Increment package window when receiving SENDME
    pub fn on_sendme_received(&mut self) -> Result<()> {
        let next = self.package_window + self.increment;
        if next > self.start {
            return Err(TorError::ProtocolViolation(format!(
                "unexpected SENDME: package window {} + {} exceeds {}",
                self.package_window, self.increment, self.start
            )));
        }

        self.package_window = next;
        log::debug!(
            "Package window: {} (+{})",
            self.package_window,
            self.increment
        );
        Ok(())
    }

    /// Process a received DATA cell and check if we should send SENDME
    ///
    /// Returns `true` if we should send a SENDME back. The deliver window
    /// has already been topped up by one increment when that happens.
    pub fn on_receive(&mut self) -> Result<bool> {
        if self.deliver_window == 0 {
            return Err(TorError::ProtocolViolation(
                "DATA cell received with empty deliver window".into(),
            ));
        }

        self.deliver_window -= 1;

        if self.deliver_window <= self.start - self.increment {
            self.deliver_window += self.increment;
            log::debug!(
                "Deliver window reached threshold, sending SENDME (window {})",
                self.deliver_window
            );
            return Ok(true);
        }

        Ok(false)
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::circuit()
    }
}
