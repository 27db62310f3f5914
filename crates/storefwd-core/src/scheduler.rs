//! Cooperative single-thread scheduler
//!
//! One driver loop serializes role handlers with transport receive
//! callbacks. `run_once` never blocks; long waits are expressed through
//! the returned delay.

use crate::packet::MeshPacket;
use crate::roles::Role;

// ----------------------------------------------------------------------------
// Tick Constants
// ----------------------------------------------------------------------------

/// Normal tick of an active role
pub const ACTIVE_TICK_MS: u64 = 5000;

/// Tick of an inactive role
pub const IDLE_TICK_MS: u64 = 30_000;

/// Short tick requested to drain a pending notification promptly
pub const PROMPT_TICK_MS: u64 = 100;

/// Worst-case airtime of one packet; paces replay drains
pub const PACKET_TIME_MAX_MS: u64 = 5000;

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Re-arms the role's `run_once` at the cadence it asks for
pub struct Scheduler {
    role: Role,
    next_due_ms: u64,
}

impl Scheduler {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            next_due_ms: 0,
        }
    }

    /// Deliver a received packet to the role
    pub fn on_receive(&mut self, packet: &MeshPacket) {
        self.role.on_receive(packet);
    }

    /// Run the role if its tick is due; returns milliseconds until the
    /// next due time
    pub fn tick(&mut self, now_ms: u64) -> u64 {
        if now_ms >= self.next_due_ms {
            let delay = self.role.run_once();
            self.next_due_ms = now_ms + delay;
        }
        self.next_due_ms.saturating_sub(now_ms)
    }

    /// Drive the role forever with a blocking sleep between ticks
    pub fn run_blocking(&mut self) -> ! {
        loop {
            let delay = self.role.run_once();
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_mut(&mut self) -> &mut Role {
        &mut self.role
    }

    /// Tear the role down, flushing persistent state
    pub fn shutdown(&mut self) {
        self.role.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_role_ticks_slowly() {
        let mut scheduler = Scheduler::new(Role::Inactive);
        assert_eq!(scheduler.tick(0), IDLE_TICK_MS);
        // Not yet due: remaining time shrinks, run_once is not re-entered.
        assert_eq!(scheduler.tick(10_000), IDLE_TICK_MS - 10_000);
        assert_eq!(scheduler.tick(IDLE_TICK_MS), IDLE_TICK_MS);
    }
}
