//! Worker thread to allow the horizon to be optimised without blocking telemetry intake.
//!
//! Telemetry is posted into a single slot [`Mailbox`], replacing whatever the worker hasn't yet
//! picked up, so cycles are never queued. When a solve finishes the worker checks whether newer
//! telemetry arrived meanwhile. If it did the result is stale and is discarded without being
//! committed to the controller.

// -----------------------------------------------------------------------------------------------
// INCLUDES
// -----------------------------------------------------------------------------------------------

use std::sync::{mpsc::Sender, Arc, Condvar, Mutex, MutexGuard};

use log::{debug, warn};

use crate::traj_ctrl::{InputData, OutputData, StatusReport, TrajCtrl};

// -----------------------------------------------------------------------------------------------
// STRUCTS
// -----------------------------------------------------------------------------------------------

/// Single slot mailbox holding the most recent telemetry.
#[derive(Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    cvar: Condvar,
}

#[derive(Default)]
struct Slot {
    /// Sequence number of the most recently posted input
    seq: u64,

    /// Input not yet taken by the worker
    latest: Option<(u64, InputData)>,

    stop: bool,
}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkerSignal {
    /// A command was computed from the input with the given sequence number and committed
    Command(u64, Box<OutputData>, StatusReport),

    /// The result for the input with the given sequence number was stale and has been dropped
    Discarded(u64),
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post new input, replacing any input the worker hasn't picked up. Returns the sequence
    /// number of the input.
    pub fn post(&self, input: InputData) -> u64 {
        let mut slot = self.lock();
        slot.seq += 1;
        let seq = slot.seq;

        if let Some((old, _)) = slot.latest.replace((seq, input)) {
            debug!("Input {} replaced before being processed", old);
        }

        drop(slot);
        self.cvar.notify_one();

        seq
    }

    /// Sequence number of the most recently posted input.
    pub fn latest_seq(&self) -> u64 {
        self.lock().seq
    }

    /// Ask the worker to stop.
    pub fn stop(&self) {
        self.lock().stop = true;
        self.cvar.notify_all();
    }

    /// Block until input is available, returning `None` once a stop has been requested.
    pub fn take(&self) -> Option<(u64, InputData)> {
        let mut slot = self.lock();

        loop {
            if slot.stop {
                return None;
            }
            if let Some(latest) = slot.latest.take() {
                return Some(latest);
            }

            slot = match self.cvar.wait(slot) {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // The slot is always left consistent so a poisoned lock is still usable
        match self.slot.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Run the controller on inputs from the mailbox until it is stopped or the main thread hangs up.
pub fn worker_thread(mut traj_ctrl: TrajCtrl, mailbox: Arc<Mailbox>, main_sender: Sender<WorkerSignal>) {
    while let Some((seq, input)) = mailbox.take() {
        let cycle = traj_ctrl.compute(&input);

        let signal = if mailbox.latest_seq() != seq {
            debug!("Result for input {} is stale, discarding", seq);
            WorkerSignal::Discarded(seq)
        } else {
            if let Err(e) = traj_ctrl.commit(&cycle) {
                warn!("Could not commit the cycle: {}", e);
            }
            WorkerSignal::Command(seq, Box::new(cycle.output), cycle.report)
        };

        if main_sender.send(signal).is_err() {
            break;
        }
    }

    debug!("Worker thread stopping");
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::traj_ctrl::{Params, Pose};
    use std::{sync::mpsc::channel, thread, time::Duration};

    fn straight_input(speed: f64) -> InputData {
        InputData {
            ptsx: vec![0.0, 10.0, 20.0, 30.0, 40.0],
            ptsy: vec![0.0; 5],
            pose: Pose::default(),
            speed,
            ..Default::default()
        }
    }

    #[test]
    fn test_mailbox_keeps_latest() {
        let mailbox = Mailbox::new();

        assert_eq!(mailbox.post(straight_input(1.0)), 1);
        assert_eq!(mailbox.post(straight_input(2.0)), 2);

        let (seq, input) = mailbox.take().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(input.speed, 2.0);
        assert_eq!(mailbox.latest_seq(), 2);

        mailbox.stop();
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn test_worker() {
        let mut params = Params::default();
        params.solver_time_budget_s = 2.0;
        let traj_ctrl = TrajCtrl::new(params).unwrap();

        let mailbox = Arc::new(Mailbox::new());
        let (sender, receiver) = channel();

        let worker_mailbox = mailbox.clone();
        let jh = thread::spawn(move || worker_thread(traj_ctrl, worker_mailbox, sender));

        let seq = mailbox.post(straight_input(10.0));

        match receiver.recv_timeout(Duration::from_secs(10)).unwrap() {
            WorkerSignal::Command(s, output, _) => {
                assert_eq!(s, seq);
                assert!(output.throttle > 0.0);
            }
            WorkerSignal::Discarded(s) => panic!("Input {} unexpectedly discarded", s),
        }

        mailbox.stop();
        jh.join().unwrap();
    }
}
