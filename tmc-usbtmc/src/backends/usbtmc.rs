//! # USBTMC Kernel Driver Backend
//!
//! For instruments attached through the Linux `usbtmc` kernel driver, which
//! exposes them as `/dev/usbtmcN`. Messages are exchanged with plain reads and
//! writes, the USB488 side channel is reached through the driver's ioctls.
//!
//! ## Example Usage
//!
//! ```ignore
//! use tmc_usbtmc::backends::usbtmc::UsbTmcDevice;
//! use tmc_sync::engine::{Config, SyncEngine};
//!
//! let device = UsbTmcDevice::new("/dev/usbtmc0")?;
//! let mut engine = SyncEngine::new(device, Config::default());
//! println!("{}", engine.query("*IDN?")?);
//! ```
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, OFlag, fcntl},
    ioctl_none, ioctl_read, ioctl_write_ptr,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    unistd::getpid,
};
use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    os::fd::{AsFd, AsRawFd},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};
use tokio::signal::unix::{SignalKind, signal};

use tmc_protocol::{Capabilities, StatusByte, decode_status_byte};
use tmc_sync::{TermChar, Transport, notify::NotifyCell};

/// Argument of `USBTMC_IOCTL_CONFIG_TERMCHAR`
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct UsbTmcTermChar {
    term_char: u8,
    term_char_enabled: u8,
}

// Defined in include/uapi/linux/usb/tmc.h
const USBTMC_IOC_NR: u8 = 91;

ioctl_none!(usbtmc_clear, USBTMC_IOC_NR, 2);
ioctl_read!(usbtmc_get_timeout, USBTMC_IOC_NR, 9, u32);
ioctl_write_ptr!(usbtmc_set_timeout, USBTMC_IOC_NR, 10, u32);
ioctl_write_ptr!(usbtmc_eom_enable, USBTMC_IOC_NR, 11, u8);
ioctl_write_ptr!(usbtmc_config_termchar, USBTMC_IOC_NR, 12, UsbTmcTermChar);
ioctl_read!(usbtmc488_get_caps, USBTMC_IOC_NR, 17, u8);
ioctl_read!(usbtmc488_read_stb, USBTMC_IOC_NR, 18, u8);
ioctl_write_ptr!(usbtmc488_ren_control, USBTMC_IOC_NR, 19, u8);
ioctl_none!(usbtmc488_goto_local, USBTMC_IOC_NR, 20);
ioctl_none!(usbtmc488_local_lockout, USBTMC_IOC_NR, 21);
ioctl_none!(usbtmc488_trigger, USBTMC_IOC_NR, 22);
ioctl_write_ptr!(usbtmc488_wait_srq, USBTMC_IOC_NR, 23, u32);
ioctl_read!(usbtmc_msg_in_attr, USBTMC_IOC_NR, 24, u8);
ioctl_read!(usbtmc_get_stb, USBTMC_IOC_NR, 26, u8);
ioctl_read!(usbtmc_get_srq_stb, USBTMC_IOC_NR, 27, u8);

/// `USBTMC_IOCTL_MSG_IN_ATTR` bit set when the last read ended a message.
const MSG_IN_ATTR_EOM: u8 = 1;

type Subscribers = Arc<Mutex<Vec<Arc<NotifyCell>>>>;

/// An instrument accessed through the Linux usbtmc driver.
pub struct UsbTmcDevice {
    file: File,
    term_char: TermChar,
    /// Cells fired by the SIGIO listener. `None` until the first subscription.
    subscribers: Option<Subscribers>,
}

impl UsbTmcDevice {
    pub fn new(device_path: impl AsRef<Path>) -> io::Result<UsbTmcDevice> {
        let path = device_path.as_ref();
        log::debug!("Opening usbtmc device: {}", path.display());
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        log::debug!("Device file opened successfully");

        let device = UsbTmcDevice {
            file,
            // The driver does not report its termination character, this is its default.
            term_char: TermChar::default(),
            subscribers: None,
        };
        log::info!(
            "Opened {} (capabilities 0x{:02x}, timeout {:?})",
            path.display(),
            device.capabilities()?.bits(),
            device.timeout()?
        );
        Ok(device)
    }

    fn read_u8(&self, request: unsafe fn(i32, *mut u8) -> nix::Result<i32>) -> io::Result<u8> {
        let mut value = 0u8;
        // SAFETY: The file descriptor is open and the driver writes a single byte to `value`.
        unsafe {
            request(self.file.as_raw_fd(), &mut value)?;
        }
        Ok(value)
    }

    fn write_u8(
        &self,
        request: unsafe fn(i32, *const u8) -> nix::Result<i32>,
        value: u8,
    ) -> io::Result<()> {
        // SAFETY: The file descriptor is open and the driver reads a single byte from `value`.
        unsafe {
            request(self.file.as_raw_fd(), &value)?;
        }
        Ok(())
    }

    fn request(&self, request: unsafe fn(i32) -> nix::Result<i32>) -> io::Result<()> {
        // SAFETY: The file descriptor is open and the request takes no argument.
        unsafe {
            request(self.file.as_raw_fd())?;
        }
        Ok(())
    }

    /// Asserts (`true`) or releases (`false`) the remote enable line.
    pub fn remote_enable(&self, enable: bool) -> io::Result<()> {
        log::debug!("Remote enable: {}", enable);
        self.write_u8(usbtmc488_ren_control, u8::from(enable))
    }

    /// Returns the instrument to local control.
    pub fn goto_local(&self) -> io::Result<()> {
        log::debug!("Go to local");
        self.request(usbtmc488_goto_local)
    }

    /// Disables the instrument's front panel local control.
    pub fn local_lockout(&self) -> io::Result<()> {
        log::debug!("Local lockout");
        self.request(usbtmc488_local_lockout)
    }

    /// Blocks until the driver reports a service request through `POLLPRI`.
    fn poll_service_request(&self) -> io::Result<()> {
        loop {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLPRI)];
            match poll(&mut fds, PollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
                Ok(_) => {}
            }
            let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
            if revents.contains(PollFlags::POLLPRI) {
                return Ok(());
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(io::Error::new(
                    ErrorKind::BrokenPipe,
                    format!("device poll failed: {:?}", revents),
                ));
            }
        }
    }

    /// Installs the SIGIO listener, then routes the driver's SIGIO to this process.
    fn enable_async_notification(&self, subscribers: Subscribers) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()?;
        // The handler must be in place before O_ASYNC is set, SIGIO terminates the process by default.
        let mut sigio = {
            let _guard = runtime.enter();
            signal(SignalKind::io())?
        };
        thread::Builder::new()
            .name("usbtmc-sigio".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while sigio.recv().await.is_some() {
                        log::trace!("SIGIO received");
                        let cells = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
                        for cell in cells.iter() {
                            cell.fire();
                        }
                    }
                })
            })?;

        // SAFETY: F_SETOWN takes a process id and the file descriptor is open.
        let owner = unsafe {
            nix::libc::fcntl(
                self.file.as_raw_fd(),
                nix::libc::F_SETOWN,
                getpid().as_raw(),
            )
        };
        if owner < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = OFlag::from_bits_retain(fcntl(&self.file, FcntlArg::F_GETFL)?);
        fcntl(&self.file, FcntlArg::F_SETFL(flags | OFlag::O_ASYNC))?;
        log::debug!("Asynchronous notification enabled");
        Ok(())
    }
}

impl Read for UsbTmcDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            Ok(n) => {
                log::trace!("Read {} bytes: {:02x?}", n, &buf[..n]);
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => Err(err),
            Err(err) => {
                log::error!("Read failed: {}", err);
                // Stops the instrument from sending the rest of the aborted response.
                if let Err(clear) = self.clear() {
                    log::error!("Device clear after failed read failed: {}", clear);
                }
                Err(err)
            }
        }
    }
}

impl Write for UsbTmcDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        log::trace!("Write {:02x?}", buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Transport for UsbTmcDevice {
    fn clear(&mut self) -> io::Result<()> {
        log::debug!("Device clear");
        self.request(usbtmc_clear)
    }

    fn timeout(&self) -> io::Result<Duration> {
        let mut millis = 0u32;
        // SAFETY: The file descriptor is open and the driver writes a u32 to `millis`.
        unsafe {
            usbtmc_get_timeout(self.file.as_raw_fd(), &mut millis)?;
        }
        Ok(Duration::from_millis(millis.into()))
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let millis = u32::try_from(timeout.as_millis()).map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("timeout {:?} exceeds the driver limit", timeout),
            )
        })?;
        log::debug!("Setting timeout to {} ms", millis);
        // SAFETY: The file descriptor is open and the driver reads a u32 from `millis`.
        unsafe {
            usbtmc_set_timeout(self.file.as_raw_fd(), &millis)?;
        }
        Ok(())
    }

    fn configure_terminator(&mut self, term_char: TermChar) -> io::Result<TermChar> {
        let config = UsbTmcTermChar {
            term_char: term_char.byte,
            term_char_enabled: u8::from(term_char.enabled),
        };
        log::debug!(
            "Setting termination character 0x{:02x}, enabled {}",
            term_char.byte,
            term_char.enabled
        );
        // SAFETY: The file descriptor is open and `config` has the layout of `struct usbtmc_termchar`.
        unsafe {
            usbtmc_config_termchar(self.file.as_raw_fd(), &config)?;
        }
        Ok(std::mem::replace(&mut self.term_char, term_char))
    }

    fn read_status_byte(&mut self) -> io::Result<StatusByte> {
        self.read_u8(usbtmc488_read_stb).map(decode_status_byte)
    }

    fn srq_status_byte(&mut self) -> io::Result<StatusByte> {
        match self.read_u8(usbtmc_get_srq_stb) {
            Ok(stb) => Ok(decode_status_byte(stb)),
            // No service request since the last call.
            Err(err) if err.raw_os_error() == Some(Errno::ENOMSG as i32) => Ok(StatusByte::empty()),
            Err(err) => Err(err),
        }
    }

    fn control_status_byte(&mut self) -> io::Result<StatusByte> {
        self.read_u8(usbtmc_get_stb).map(decode_status_byte)
    }

    fn wait_for_service_request(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let Some(timeout) = timeout else {
            return self.poll_service_request();
        };
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        // SAFETY: The file descriptor is open and the driver reads a u32 from `millis`.
        unsafe {
            usbtmc488_wait_srq(self.file.as_raw_fd(), &millis)?;
        }
        Ok(())
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        self.read_u8(usbtmc488_get_caps)
            .map(Capabilities::from_bits_retain)
    }

    fn set_end_of_message(&mut self, enabled: bool) -> io::Result<()> {
        self.write_u8(usbtmc_eom_enable, u8::from(enabled))
    }

    fn end_of_message(&mut self) -> io::Result<bool> {
        let attr = self.read_u8(usbtmc_msg_in_attr)?;
        Ok(attr & MSG_IN_ATTR_EOM != 0)
    }

    fn trigger(&mut self) -> io::Result<()> {
        log::debug!("Trigger");
        self.request(usbtmc488_trigger)
    }

    fn subscribe(&mut self, cell: Arc<NotifyCell>) -> io::Result<()> {
        if let Some(subscribers) = &self.subscribers {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(cell);
            return Ok(());
        }
        let subscribers: Subscribers = Arc::new(Mutex::new(vec![cell]));
        self.enable_async_notification(Arc::clone(&subscribers))?;
        self.subscribers = Some(subscribers);
        Ok(())
    }
}
