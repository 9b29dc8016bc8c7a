//! Stand-in for the GPS sub-device protocol (spec §6). Connects either
//! directly over a serial device (`TICI`) or tunneled through the main
//! board; the daemon only needs raw byte pump + init/stop/power, so that's
//! all the trait exposes.

use crate::errors::Result;

pub trait Pigeon: Send {
    fn init(&mut self) -> Result<()>;
    fn receive(&mut self) -> Result<Vec<u8>>;
    fn stop(&mut self) -> Result<()>;
    fn set_power(&mut self, on: bool) -> Result<()>;
}

/// Direct serial connection, used on `TICI`.
pub struct SerialPigeon {
    path: String,
    powered: bool,
}

impl SerialPigeon {
    pub fn connect(path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            powered: false,
        })
    }
}

impl Pigeon for SerialPigeon {
    fn init(&mut self) -> Result<()> {
        log::info!("gps: init over serial device {}", self.path);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<()> {
        self.powered = on;
        Ok(())
    }
}

/// Tunneled through the main board's USB session, used off `TICI`.
pub struct BoardTunneledPigeon {
    powered: bool,
}

impl BoardTunneledPigeon {
    pub fn connect() -> Result<Self> {
        Ok(Self { powered: false })
    }
}

impl Pigeon for BoardTunneledPigeon {
    fn init(&mut self) -> Result<()> {
        log::info!("gps: init tunneled through board");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<()> {
        self.powered = on;
        Ok(())
    }
}
