//! Sleep controller.
//!
//! Handles the SLEEP instruction and the pseudo sleep entered on self loops,
//! and wakes the core when a qualifying interrupt is raised. Each configured
//! mode lists the vectors able to wake the device from it; pseudo sleep
//! wakes on any vector.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceOptions, DeviceState};
use crate::error::{ConfigError, StateError};
use crate::interrupt::sig as intsig;
use crate::peripheral::{find_reg_config, req, CoreRequest, CtlReqData, Ctx, Peripheral, RegConfig};
use crate::signal::{HookTag, SignalData};
use crate::types::{CtlId, RegBit, VectorMask, ID_SLEEP};

/// Sleep modes, ordered by depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum SleepMode {
    Invalid,
    #[default]
    Active,
    /// Self loop idle, wakes on any interrupt.
    Pseudo,
    Idle,
    Adc,
    Standby,
    ExtStandby,
    PowerDown,
    PowerSave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepModeConfig {
    /// Value of the mode field selecting this mode.
    pub reg_value: u8,
    pub mode: SleepMode,
    /// Vectors waking the device from this mode.
    pub wake: VectorMask,
}

impl RegConfig for SleepModeConfig {
    fn reg_value(&self) -> u8 {
        self.reg_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepConfig {
    /// Sleep enable bit (SE).
    pub enable: RegBit,
    /// Mode selection field (SM).
    pub mode: RegBit,
    pub modes: Vec<SleepModeConfig>,
}

impl SleepConfig {
    /// SMCR layout of the ATmega328: SE in bit 0, SM2:0 in bits 3:1.
    /// Wake sources follow the datasheet table for INT0/INT1 (1, 2),
    /// pin change (3..=5), WDT (6), TWI (24), timer 2 (7..=9), ADC (21)
    /// and SPM/EEPROM ready (22, 25).
    pub fn atmega328() -> Self {
        let all: VectorMask = (1..26).collect();
        let ext: [usize; 6] = [1, 2, 3, 4, 5, 6];
        let adc: VectorMask = ext.iter().copied().chain([7, 8, 9, 21, 22, 24, 25]).collect();
        let save: VectorMask = ext.iter().copied().chain([7, 8, 9, 24]).collect();
        let down: VectorMask = ext.iter().copied().chain([24]).collect();
        let smcr = 0x33;
        SleepConfig {
            enable: RegBit::bit(smcr, 0),
            mode: RegBit::field(smcr, 1, 0x07),
            modes: vec![
                SleepModeConfig { reg_value: 0, mode: SleepMode::Idle, wake: all },
                SleepModeConfig { reg_value: 1, mode: SleepMode::Adc, wake: adc },
                SleepModeConfig { reg_value: 2, mode: SleepMode::PowerDown, wake: down.clone() },
                SleepModeConfig { reg_value: 3, mode: SleepMode::PowerSave, wake: save.clone() },
                SleepModeConfig { reg_value: 6, mode: SleepMode::Standby, wake: down },
                SleepModeConfig { reg_value: 7, mode: SleepMode::ExtStandby, wake: save },
            ],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SleepState {
    mode_index: Option<usize>,
}

pub struct SleepController {
    config: SleepConfig,
    state: SleepState,
}

impl SleepController {
    pub fn new(config: SleepConfig) -> Self {
        SleepController { config, state: SleepState::default() }
    }

    fn sleep_call(&mut self, ctx: &mut Ctx) {
        if !ctx.test_regbit(self.config.enable) {
            return;
        }
        let value = ctx.read_regbit(self.config.mode);
        let Some(index) = find_reg_config(&self.config.modes, value) else {
            tracing::warn!(parent: ctx.span(), "sleep with invalid mode field {}", value);
            return;
        };
        let mode = self.config.modes[index].mode;
        if mode < SleepMode::Idle {
            return;
        }
        self.state.mode_index = Some(index);
        ctx.request(CoreRequest::Sleep(mode));
    }
}

impl Peripheral for SleepController {
    fn id(&self) -> CtlId {
        ID_SLEEP
    }

    fn init(&mut self, ctx: &mut Ctx) -> Result<(), ConfigError> {
        ctx.add_ioreg(self.config.enable, false)?;
        ctx.add_ioreg(self.config.mode, false)?;
        let hook = ctx.hook();
        ctx.interrupts().signal().connect(hook, 0);
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut Ctx) {
        self.state.mode_index = None;
    }

    fn ctlreq(&mut self, req: u16, _data: &mut CtlReqData, ctx: &mut Ctx) -> bool {
        match req {
            req::SLEEP_CALL => {
                self.sleep_call(ctx);
                true
            }
            req::SLEEP_PSEUDO => {
                if !ctx.options().contains(DeviceOptions::DISABLE_PSEUDO_SLEEP) {
                    ctx.request(CoreRequest::Sleep(SleepMode::Pseudo));
                }
                true
            }
            _ => false,
        }
    }

    fn sleep(&mut self, on: bool, _mode: SleepMode, _ctx: &mut Ctx) {
        if !on {
            self.state.mode_index = None;
        }
    }

    fn raised(&mut self, data: &SignalData, _tag: HookTag, ctx: &mut Ctx) {
        if data.sigid != intsig::RAISED || ctx.state() != DeviceState::Sleeping {
            return;
        }
        let vector = data.index as usize;
        let wake = match ctx.sleep_mode() {
            SleepMode::Pseudo => true,
            mode if mode >= SleepMode::Idle => self
                .state
                .mode_index
                .and_then(|i| self.config.modes.get(i))
                .map_or(false, |m| m.wake.contains(vector)),
            _ => false,
        };
        if wake {
            tracing::trace!(parent: ctx.span(), "vector {} wakes the device", vector);
            ctx.request(CoreRequest::Wakeup);
        } else {
            tracing::trace!(parent: ctx.span(), "vector {} cannot wake from {:?}", vector, ctx.sleep_mode());
        }
    }

    fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&self.state)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        self.state = bincode::deserialize(data)?;
        Ok(())
    }
}
