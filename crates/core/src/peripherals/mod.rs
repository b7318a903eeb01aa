//! On-chip peripheral models.
//!
//! - [`Port`]: GPIO port (PORTx, DDRx, PINx)
//! - [`Timer8`]: 8-bit timer/counter, normal and CTC modes
//! - [`Adc`]: 10-bit analog-to-digital converter
//! - [`Spi`]: SPI master
//! - [`Eeprom`]: EEPROM controller
//! - [`NvmController`]: self-programming of the flash (SPM)
//! - [`Watchdog`]: watchdog timer and MCUSR
//! - [`Usart`]: asynchronous USART
//! - [`ExtInt`]: INTn and pin change interrupts
//! - [`DummyController`]: registers of unmodelled peripherals
//!
//! The sleep controller lives in [`crate::sleep`].

mod adc;
mod dummy;
mod eeprom;
mod extint;
mod nvm;
mod port;
mod spi;
mod timer8;
mod usart;
mod watchdog;

#[cfg(test)]
pub mod testutil;

pub use adc::{Adc, AdcConfig, AdcInput, AdcMux, AdcReference, AdcRefSelect, BANDGAP_VOLTS};
pub use dummy::DummyController;
pub use eeprom::{Eeprom, EepromConfig};
pub use extint::{ExtInt, ExtIntConfig};
pub use nvm::{NvmConfig, NvmController};
pub use port::{Port, PortConfig};
pub use spi::{Spi, SpiConfig};
pub use timer8::{ClockSelect, Timer8, Timer8Config};
pub use usart::{Usart, UsartConfig};
pub use watchdog::{Watchdog, WatchdogConfig};

/// Signal ids, by peripheral.
pub mod sig {
    pub use super::adc::sig as adc;
    pub use super::extint::sig as extint;
    pub use super::port::sig as port;
    pub use super::spi::sig as spi;
    pub use super::usart::sig as usart;
}

use crate::peripheral::Peripheral;
use crate::sleep::{SleepConfig, SleepController};

/// The modelled peripherals of an ATmega328, in attach order.
pub fn atmega328_peripherals() -> Vec<Box<dyn Peripheral>> {
    vec![
        Box::new(SleepController::new(SleepConfig::atmega328())),
        Box::new(Port::new(PortConfig::atmega328('B'))),
        Box::new(Port::new(PortConfig::atmega328('C'))),
        Box::new(Port::new(PortConfig::atmega328('D'))),
        Box::new(ExtInt::new(ExtIntConfig::atmega328())),
        Box::new(Watchdog::new(WatchdogConfig::atmega328())),
        Box::new(NvmController::new(NvmConfig::atmega328())),
        Box::new(Timer8::new(Timer8Config::atmega328_timer0())),
        Box::new(Timer8::new(Timer8Config::atmega328_timer2())),
        Box::new(Adc::new(AdcConfig::atmega328())),
        Box::new(Spi::new(SpiConfig::atmega328())),
        Box::new(Usart::new(UsartConfig::atmega328())),
        Box::new(Eeprom::new(EepromConfig::atmega328())),
        Box::new(DummyController::atmega328()),
    ]
}
