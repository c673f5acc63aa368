//! pigpiod socket client
//!
//! Speaks the daemon's command protocol directly: every request and reply is
//! four little-endian `u32` words `[cmd, p1, p2, p3]`. In a reply the last
//! word is the result, negative on error.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::actuator::{angle_to_pulse_us, ActuatorDriver};
use crate::error::ChatterError;

/// Command codes used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Modes = 0,
    Write = 4,
    Servo = 8,
}

const MODE_OUTPUT: u32 = 1;

/// Encode one command frame.
pub fn encode_command(cmd: Command, p1: u32, p2: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u32_le(cmd as u32);
    buf.put_u32_le(p1);
    buf.put_u32_le(p2);
    buf.put_u32_le(0);
    buf
}

/// Result word of a reply frame.
pub fn decode_result(mut reply: &[u8]) -> Result<i32, PigpioError> {
    if reply.len() < 16 {
        return Err(PigpioError::Protocol(format!("short reply ({} bytes)", reply.len())));
    }
    reply.advance(12);
    Ok(reply.get_i32_le())
}

/// Errors from the pigpiod connection
#[derive(Debug, thiserror::Error)]
pub enum PigpioError {
    #[error("cannot reach pigpiod at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pigpiod I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("pigpiod protocol: {0}")]
    Protocol(String),

    #[error("pigpiod rejected {cmd:?} on gpio {gpio}: error {code}")]
    Rejected { cmd: Command, gpio: u32, code: i32 },
}

impl From<PigpioError> for ChatterError {
    fn from(e: PigpioError) -> Self {
        ChatterError::ActuatorFault(e.to_string())
    }
}

/// Servo and power pins driven through pigpiod.
///
/// A dropped connection is re-established on the next command.
pub struct PigpioDriver {
    addr: String,
    timeout: Duration,
    servo_gpio: Option<u8>,
    power_gpio: Option<u8>,
    stream: Option<TcpStream>,
}

impl PigpioDriver {
    /// Connect and put both pins into a safe state (outputs, no pulse, power off).
    pub fn connect(
        addr: &str,
        timeout: Duration,
        servo_gpio: Option<u8>,
        power_gpio: Option<u8>,
    ) -> Result<Self, PigpioError> {
        let mut driver = Self {
            addr: addr.to_string(),
            timeout,
            servo_gpio,
            power_gpio,
            stream: None,
        };
        driver.reconnect()?;

        if let Some(gpio) = servo_gpio {
            driver.command(Command::Modes, gpio as u32, MODE_OUTPUT)?;
            driver.command(Command::Servo, gpio as u32, 0)?;
        }
        if let Some(gpio) = power_gpio {
            driver.command(Command::Modes, gpio as u32, MODE_OUTPUT)?;
            driver.command(Command::Write, gpio as u32, 0)?;
        }
        info!(addr, ?servo_gpio, ?power_gpio, "pigpiod connected");
        Ok(driver)
    }

    fn reconnect(&mut self) -> Result<&mut TcpStream, PigpioError> {
        let connect_err = |source| PigpioError::Connect {
            addr: self.addr.clone(),
            source,
        };
        let addrs: Vec<SocketAddr> = self.addr.to_socket_addrs().map_err(connect_err)?.collect();
        let addr = addrs.first().ok_or_else(|| PigpioError::Connect {
            addr: self.addr.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address"),
        })?;

        let stream = TcpStream::connect_timeout(addr, self.timeout).map_err(|source| {
            PigpioError::Connect {
                addr: self.addr.clone(),
                source,
            }
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "pigpiod socket open");
        Ok(self.stream.insert(stream))
    }

    fn command(&mut self, cmd: Command, p1: u32, p2: u32) -> Result<i32, PigpioError> {
        let frame = encode_command(cmd, p1, p2);
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => self.reconnect()?,
        };

        let mut reply = [0u8; 16];
        let io = stream
            .write_all(&frame)
            .and_then(|_| stream.read_exact(&mut reply));
        if let Err(e) = io {
            warn!(error = %e, "pigpiod connection lost");
            self.stream = None;
            return Err(PigpioError::Io(e));
        }

        let code = decode_result(&reply)?;
        if code < 0 {
            return Err(PigpioError::Rejected { cmd, gpio: p1, code });
        }
        Ok(code)
    }
}

impl ActuatorDriver for PigpioDriver {
    fn set_angle(&mut self, angle: f32) -> Result<(), ChatterError> {
        if let Some(gpio) = self.servo_gpio {
            self.command(Command::Servo, gpio as u32, angle_to_pulse_us(angle))?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), ChatterError> {
        if let Some(gpio) = self.servo_gpio {
            self.command(Command::Servo, gpio as u32, 0)?;
        }
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<(), ChatterError> {
        if let Some(gpio) = self.power_gpio {
            self.command(Command::Write, gpio as u32, on as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_encode_servo_frame() {
        let frame = encode_command(Command::Servo, 17, 1500);
        assert_eq!(
            &frame[..],
            &[8, 0, 0, 0, 17, 0, 0, 0, 0xDC, 0x05, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_decode_negative_result() {
        let mut reply = BytesMut::new();
        reply.put_u32_le(8);
        reply.put_u32_le(99);
        reply.put_u32_le(1500);
        reply.put_i32_le(-3);
        assert_eq!(decode_result(&reply).unwrap(), -3);
        assert!(decode_result(&reply[..8]).is_err());
    }

    /// A fake daemon that echoes frames back with result 0 and records them.
    fn fake_daemon(frames: usize) -> (String, thread::JoinHandle<Vec<[u32; 3]>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for _ in 0..frames {
                let mut buf = [0u8; 16];
                sock.read_exact(&mut buf).unwrap();
                let mut b = &buf[..];
                seen.push([b.get_u32_le(), b.get_u32_le(), b.get_u32_le()]);
                buf[12..].copy_from_slice(&0i32.to_le_bytes());
                sock.write_all(&buf).unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn test_driver_sequence_against_fake_daemon() {
        // 4 setup frames, then angle, release, power on
        let (addr, daemon) = fake_daemon(7);
        let mut driver =
            PigpioDriver::connect(&addr, Duration::from_millis(500), Some(17), Some(23)).unwrap();
        driver.set_angle(90.0).unwrap();
        driver.release().unwrap();
        driver.set_power(true).unwrap();

        let seen = daemon.join().unwrap();
        assert_eq!(
            seen,
            vec![
                [0, 17, 1],
                [8, 17, 0],
                [0, 23, 1],
                [4, 23, 0],
                [8, 17, 1500],
                [8, 17, 0],
                [4, 23, 1],
            ]
        );
    }

    #[test]
    fn test_unreachable_daemon_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = PigpioDriver::connect(&addr, Duration::from_millis(200), Some(17), None);
        assert!(matches!(err, Err(PigpioError::Connect { .. })));
    }
}
