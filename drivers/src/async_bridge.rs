/*++

Licensed under the Apache-2.0 license.

File Name:

    async_bridge.rs

Abstract:

    File contains the bridge that turns fire-and-forget secure element
    commands into blocking calls with a deadline.

--*/

use crate::se::{status, Completion, SeCommand, SecureElement};
use crate::{cprintln, wait};
use core::time::Duration;
use sdcle_error::{SdcleError, SdcleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimeouts {
    /// Sleep between two status polls.
    pub poll_interval: Duration,
    /// Deadline for ordinary commands.
    pub operation: Duration,
    /// Deadline for metadata writes.
    pub metadata_write: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            operation: Duration::from_secs(5),
            metadata_write: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncBridge {
    timeouts: BridgeTimeouts,
}

impl AsyncBridge {
    pub fn new(timeouts: BridgeTimeouts) -> Self {
        Self { timeouts }
    }

    pub fn timeouts(&self) -> &BridgeTimeouts {
        &self.timeouts
    }

    /// Submit `cmd` and poll its completion.
    ///
    /// # Returns
    ///
    /// * The command output on success
    /// * `SE_OPERATION_TIMEOUT` if the status is still busy at the deadline
    /// * The SE status wrapped verbatim otherwise
    pub fn execute(&self, se: &mut dyn SecureElement, cmd: SeCommand) -> SdcleResult<Vec<u8>> {
        let name = cmd.name();
        let timeout = match cmd {
            SeCommand::WriteMetadata { .. } => self.timeouts.metadata_write,
            _ => self.timeouts.operation,
        };

        let completion = Completion::new();
        if let Err(rejected) = se.submit(cmd, completion.clone()) {
            cprintln!("[se] {} rejected: 0x{:04X}", name, rejected);
            return Err(SdcleError::from_se_status(rejected));
        }

        if !wait::until_timeout(self.timeouts.poll_interval, timeout, || {
            !completion.is_busy()
        }) {
            cprintln!("[se] {} timed out", name);
            return Err(SdcleError::SE_OPERATION_TIMEOUT);
        }

        match completion.status() {
            status::SUCCESS => Ok(completion.take_output()),
            failed => {
                cprintln!("[se] {} failed: 0x{:04X}", name, failed);
                Err(SdcleError::from_se_status(failed))
            }
        }
    }
}
