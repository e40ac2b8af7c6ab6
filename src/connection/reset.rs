//! Hardware reset schemes
//!
//! Development boards wire DTR and RTS to the chip's RST and GPIO0 pins in
//! several incompatible ways; each [`ResetMode`] names one wiring and knows
//! the pulse sequence that puts the chip into the ROM loader (GPIO0 low
//! through reset) or back into the application (GPIO0 released).

use log::debug;
use strum::{Display, EnumString};

use crate::{
    error::ConnectionError,
    interface::{Clock, LineLevel, SerialPort},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ResetMode {
    /// No wiring; the user presses the buttons
    #[default]
    None,
    /// DTR drives RST through a capacitor, RTS pulls down GPIO0
    Auto,
    /// DTR drives RST through a capacitor and pulls down GPIO0
    DtrOnly,
    /// DTR pulls down GPIO0, RTS pulls down RST
    Ck,
    /// DTR drives RST through a capacitor, TxD (via BREAK) drives GPIO0
    Wifio,
    /// DTR and RTS jointly drive RST and GPIO0 through two transistors
    NodeMcu,
}

impl ResetMode {
    /// Control-line levels the port should be opened with so the chip is
    /// not held in reset before the first pulse.
    pub fn initial_levels(self) -> (LineLevel, LineLevel) {
        match self {
            ResetMode::Auto | ResetMode::NodeMcu | ResetMode::Ck => (LineLevel::Low, LineLevel::Low),
            ResetMode::DtrOnly | ResetMode::Wifio => (LineLevel::Low, LineLevel::Leave),
            ResetMode::None => (LineLevel::Leave, LineLevel::Leave),
        }
    }

    /// Pulse the control lines so the chip wakes up in the ROM loader
    pub fn enter_bootloader(
        self,
        serial: &mut dyn SerialPort,
        clock: &dyn Clock,
    ) -> Result<(), ConnectionError> {
        debug!("Resetting into the ROM loader using the {self} scheme");
        match self {
            ResetMode::None => {}
            ResetMode::Auto => {
                // hold GPIO0 down while pulsing reset, release after boot
                serial.set_control(LineLevel::Low, LineLevel::High)?;
                serial.set_control(LineLevel::High, LineLevel::Leave)?;
                clock.sleep_ms(5);
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
                clock.sleep_ms(250);
                serial.set_control(LineLevel::Leave, LineLevel::Low)?;
            }
            ResetMode::DtrOnly => {
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
                serial.set_control(LineLevel::High, LineLevel::Leave)?;
                clock.sleep_ms(5);
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
                clock.sleep_ms(250);
            }
            ResetMode::Ck => {
                // RST and GPIO0 both low, release RST first
                serial.set_control(LineLevel::High, LineLevel::High)?;
                clock.sleep_ms(5);
                serial.set_control(LineLevel::Leave, LineLevel::Low)?;
                clock.sleep_ms(75);
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
            }
            ResetMode::Wifio => {
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
                serial.set_control(LineLevel::High, LineLevel::Leave)?;
                clock.sleep_ms(5);
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
                // GPIO0 is held low through the boot by a break condition
                serial.send_break(250)?;
                clock.sleep_ms(250);
            }
            ResetMode::NodeMcu => {
                serial.set_control(LineLevel::Low, LineLevel::High)?;
                clock.sleep_ms(100);
                serial.set_control(LineLevel::High, LineLevel::Low)?;
                clock.sleep_ms(75);
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
            }
        }
        Ok(())
    }

    /// Pulse reset with GPIO0 released so the chip boots the application
    pub fn enter_app(
        self,
        serial: &mut dyn SerialPort,
        clock: &dyn Clock,
    ) -> Result<(), ConnectionError> {
        debug!("Resetting into the application using the {self} scheme");
        match self {
            ResetMode::None => {}
            ResetMode::Auto | ResetMode::DtrOnly | ResetMode::Wifio => {
                serial.set_control(LineLevel::Leave, LineLevel::Low)?;
                serial.set_control(LineLevel::High, LineLevel::Leave)?;
                clock.sleep_ms(5);
                serial.set_control(LineLevel::Low, LineLevel::Leave)?;
            }
            ResetMode::Ck | ResetMode::NodeMcu => {
                serial.set_control(LineLevel::Low, LineLevel::High)?;
                clock.sleep_ms(5);
                serial.set_control(LineLevel::Leave, LineLevel::Low)?;
            }
        }
        Ok(())
    }
}
