//! # Simulator Server Module
//!
//! This module abstracts over the networking side of the MPC executable. The simulator bridge
//! connects to a bound `PAIR` socket and forwards every simulator event frame as one message.
//! Replies travel back the same way. Commands can be held back by an artificial delay without
//! blocking the receipt of new telemetry.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    net::{zmq, MonitoredSocket, MonitoredSocketError, SocketOptions},
    sim::{self, FrameError, SimEvent, SteerCmd, Telemetry, MANUAL_FRAME},
};
use log::warn;
use std::{collections::VecDeque, time::Instant};

use crate::{
    params::MpcExecParams,
    traj_ctrl::{InputData, OutputData, Pose},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An abstraction over the networking part of the MPC executable.
pub struct SimServer {
    /// PAIR socket the simulator bridge connects to
    socket: MonitoredSocket,

    /// Encoded commands waiting to be sent, in the order they are due
    pending: VecDeque<(Instant, String)>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Errors which can occur in the [`SimServer`]
#[derive(thiserror::Error, Debug)]
pub enum SimServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not receive from the bridge: {0}")]
    RecvError(zmq::Error),

    #[error("Could not send to the bridge: {0}")]
    SendError(zmq::Error),

    #[error("Frame error: {0}")]
    FrameError(FrameError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimServer {
    /// Create a new instance of the simulator server.
    ///
    /// This function will not wait for the bridge to connect before returning.
    pub fn new(ctx: &zmq::Context, params: &MpcExecParams) -> Result<Self, SimServerError> {
        let socket_options = SocketOptions {
            bind: true,
            block_on_first_connect: false,
            recv_timeout: params.recv_timeout_ms,
            send_timeout: 10,
            linger: 0,
            ..Default::default()
        };

        let socket = MonitoredSocket::new(ctx, zmq::PAIR, socket_options, &params.sim_endpoint)?;

        Ok(Self {
            socket,
            pending: VecDeque::new(),
        })
    }

    /// True if the bridge is connected.
    pub fn connected(&self) -> bool {
        self.socket.connected()
    }

    /// Receive the next event from the simulator.
    ///
    /// Returns `None` if the receive timed out or the frame was not an event.
    pub fn recv_event(&mut self) -> Result<Option<SimEvent>, SimServerError> {
        match self.socket.recv_string(0) {
            Ok(Ok(frame)) => sim::decode_frame(&frame).map_err(SimServerError::FrameError),
            Ok(Err(_)) => {
                warn!("Non UTF-8 frame received from the bridge, ignoring");
                Ok(None)
            }
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(SimServerError::RecvError(e)),
        }
    }

    /// Hand control back to manual driving.
    pub fn send_manual(&mut self) -> Result<(), SimServerError> {
        self.socket
            .send(MANUAL_FRAME, 0)
            .map_err(SimServerError::SendError)
    }

    /// Queue a command to be sent once `send_at` has passed.
    pub fn queue_command(
        &mut self,
        output: &OutputData,
        send_at: Instant,
    ) -> Result<(), SimServerError> {
        let frame =
            sim::encode_steer(&steer_cmd_from_output(output)).map_err(SimServerError::FrameError)?;

        // Commands are queued in computation order with the same delay so stay sorted
        self.pending.push_back((send_at, frame));

        Ok(())
    }

    /// Send all queued commands which are due, returning the number sent.
    pub fn send_due(&mut self, now: Instant) -> Result<usize, SimServerError> {
        let mut num_sent = 0;

        while let Some((send_at, _)) = self.pending.front() {
            if *send_at > now {
                break;
            }

            if let Some((_, frame)) = self.pending.pop_front() {
                self.socket
                    .send(frame.as_str(), 0)
                    .map_err(SimServerError::SendError)?;
                num_sent += 1;
            }
        }

        Ok(num_sent)
    }

    /// Number of commands waiting to be sent.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
}

impl From<MonitoredSocketError> for SimServerError {
    fn from(e: MonitoredSocketError) -> Self {
        SimServerError::SocketError(e)
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Convert simulator telemetry into controller input.
pub fn input_from_telemetry(telem: Telemetry) -> InputData {
    InputData {
        ptsx: telem.ptsx,
        ptsy: telem.ptsy,
        pose: Pose {
            x_m: telem.x,
            y_m: telem.y,
            psi_rad: telem.psi,
        },
        speed: telem.speed,
        steering_angle_rad: telem.steering_angle,
        throttle: telem.throttle,
    }
}

/// Convert controller output into a simulator command.
pub fn steer_cmd_from_output(output: &OutputData) -> SteerCmd {
    SteerCmd {
        steering_angle: output.steering,
        throttle: output.throttle,
        next_x: output.ref_x.clone(),
        next_y: output.ref_y.clone(),
        mpc_x: output.mpc_x.clone(),
        mpc_y: output.mpc_y.clone(),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
