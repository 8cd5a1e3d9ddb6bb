//! TCP-attached motion controller.
//!
//! Talks to the firmware bridge over a line-oriented TCP socket: one command
//! per line, acknowledged with `ok`, faults reported as `!!`-prefixed lines.
//! The firmware does not echo positions back, so the client keeps a shadow
//! of the toolhead position updated from the commands it has acknowledged;
//! homing re-anchors the shadow at the origin.

use super::{Axes, LimitKind, MachineStatus, MotionController};
use crate::error::{AppResult, PipetteError};
use crate::resources::Coordinate;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

struct Shadow {
    position: Option<Coordinate>,
    homed: bool,
    fault: Option<String>,
}

/// [`MotionController`] backed by a line-oriented TCP bridge.
pub struct RemoteController {
    addr: String,
    stream: Mutex<BufReader<TcpStream>>,
    shadow: Mutex<Shadow>,
    estopped: AtomicBool,
}

impl RemoteController {
    /// Connects to the bridge at `host:port`.
    pub async fn connect(host: &str, port: u16) -> AppResult<Self> {
        let addr = format!("{host}:{port}");
        info!(%addr, "connecting to motion controller");
        let stream = TcpStream::connect(&addr).await?;
        Ok(Self {
            addr,
            stream: Mutex::new(BufReader::new(stream)),
            shadow: Mutex::new(Shadow {
                position: None,
                homed: false,
                fault: None,
            }),
            estopped: AtomicBool::new(false),
        })
    }

    /// Sends one command line and waits for its `ok`.
    async fn send(&self, line: &str) -> AppResult<()> {
        if self.estopped.load(Ordering::SeqCst) {
            return Err(PipetteError::ControllerFault(
                "emergency stop latched; restart firmware to continue".into(),
            ));
        }
        debug!(command = line, "tx");
        let mut stream = self.stream.lock().await;
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().write_all(b"\n").await?;

        let mut response = String::new();
        loop {
            response.clear();
            let n = stream.read_line(&mut response).await?;
            if n == 0 {
                return Err(PipetteError::ControllerFault(
                    "connection closed by controller".into(),
                ));
            }
            let trimmed = response.trim();
            if trimmed == "ok" {
                return Ok(());
            }
            if let Some(message) = trimmed.strip_prefix("!!") {
                let message = message.trim().to_string();
                self.shadow.lock().await.fault = Some(message.clone());
                return Err(PipetteError::ControllerFault(message));
            }
            // Informational chatter between command and ack.
            debug!(line = trimmed, "rx");
        }
    }
}

#[async_trait]
impl MotionController for RemoteController {
    async fn move_absolute(&self, target: Coordinate, speed: f64) -> AppResult<Coordinate> {
        self.send(&format!(
            "G1 X{} Y{} Z{} F{}",
            target.x, target.y, target.z, speed
        ))
        .await?;
        self.shadow.lock().await.position = Some(target);
        Ok(target)
    }

    async fn move_relative(
        &self,
        dx: f64,
        dy: f64,
        dz: f64,
        speed: f64,
    ) -> AppResult<Coordinate> {
        // Each line is acknowledged separately.
        self.send("G91").await?;
        self.send(&format!("G1 X{dx} Y{dy} Z{dz} F{speed}")).await?;
        self.send("G90").await?;
        let mut shadow = self.shadow.lock().await;
        let to = shadow
            .position
            .unwrap_or(Coordinate::new(0.0, 0.0, 0.0))
            .offset(dx, dy, dz);
        shadow.position = Some(to);
        Ok(to)
    }

    async fn home(&self, axes: Axes) -> AppResult<Coordinate> {
        match axes {
            Axes::All => self.send("G28").await?,
            other => {
                self.send(&format!("G28 {}", other.to_string().to_uppercase()))
                    .await?
            }
        }
        let mut shadow = self.shadow.lock().await;
        shadow.homed = true;
        let home = Coordinate::new(0.0, 0.0, 0.0);
        shadow.position = Some(home);
        Ok(home)
    }

    async fn set_servo_angle(&self, angle: f64) -> AppResult<()> {
        self.send(&format!("SET_SERVO SERVO=tip_servo ANGLE={angle}"))
            .await
    }

    async fn actuate_stepper(
        &self,
        speed: f64,
        distance: f64,
        stop_on_endstop: bool,
    ) -> AppResult<()> {
        if stop_on_endstop {
            self.send(&format!(
                "MANUAL_STEPPER STEPPER=plunger SPEED={speed} MOVE={distance} STOP_ON_ENDSTOP=1 SET_POSITION=0"
            ))
            .await
        } else {
            self.send(&format!(
                "MANUAL_STEPPER STEPPER=plunger SPEED={speed} MOVE={distance}"
            ))
            .await
        }
    }

    async fn set_limit(&self, kind: LimitKind, value: f64) -> AppResult<()> {
        let line = match kind {
            LimitKind::Velocity => format!("SET_VELOCITY_LIMIT VELOCITY={value}"),
            LimitKind::Acceleration => format!("SET_VELOCITY_LIMIT ACCEL={value}"),
            LimitKind::SpeedFactor => format!("M220 S{value}"),
        };
        self.send(&line).await
    }

    async fn dwell(&self, duration: Duration) -> AppResult<()> {
        self.send(&format!("G4 P{}", duration.as_millis())).await
    }

    fn emergency_stop(&self) {
        self.estopped.store(true, Ordering::SeqCst);
        // The main connection may be blocked behind an in-flight command;
        // deliver M112 on a fresh connection so the halt is immediate.
        let addr = self.addr.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    if let Err(err) = stream.write_all(b"M112\n").await {
                        error!(%err, "failed to deliver emergency stop");
                    }
                }
                Err(err) => error!(%err, "failed to reach controller for emergency stop"),
            }
        });
    }

    async fn status(&self) -> AppResult<MachineStatus> {
        let shadow = self.shadow.lock().await;
        Ok(MachineStatus {
            position: shadow.position,
            homed: shadow.homed,
            fault: if self.estopped.load(Ordering::SeqCst) {
                Some("emergency stop latched".into())
            } else {
                shadow.fault.clone()
            },
        })
    }
}
