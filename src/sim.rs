// Simulated motors for running the control core without hardware
//
// Each SimMotor is a plant driven by the same discrete model the observer
// uses, stepped once per control tick by SimHardware::poll. Counter and
// actuator handles share the plant through an Arc<Mutex<..>>.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::config::{LOOP_TIME_MS, NUM_MOTOR_PORTS};
use crate::error::{Error, Result};
use crate::motor::angle::{Angle, MDEG_PER_ROTATION};
use crate::motor::device::{Actuation, Actuator, Counter, Hardware};
use crate::motor::math::{Fix16, saturate};
use crate::motor::observer::{ModelState, ObserverModel};

struct Plant {
    model: ObserverModel,
    state: ModelState,
    actuation: Actuation,
    counts_per_degree: Fix16,
    absolute: bool,
    blocked: bool,
    time: Option<u32>,
}

impl Plant {
    /// Advance one tick
    ///
    /// Friction is applied against the direction of motion, and a motor at
    /// rest only breaks away once the input exceeds the friction voltage.
    fn step(&mut self) {
        let voltage = self.actuation.model_voltage();
        let speed = self.state.speed;

        if self.blocked {
            self.state.speed = 0;
            self.state.current = 0;
            return;
        }
        let breakaway = self.model.torque_to_voltage(self.model.torque_friction / 2);
        if speed == 0 && voltage.saturating_abs() <= breakaway {
            self.state.current = 0;
            return;
        }

        // The model treats zero speed as reverse motion, so step in a frame
        // where the motor moves backward
        let forward = if speed != 0 { speed > 0 } else { voltage > 0 };
        let flip = |value: i32| if forward { value.wrapping_neg() } else { value };
        let start = ModelState {
            angle: Angle::ZERO,
            speed: flip(speed),
            current: flip(self.state.current),
        };
        let next = self.model.predict(&start, flip(voltage));
        // No step against the direction of motion
        let delta = next.angle.to_mdeg().min(0);

        self.state.angle = self
            .state
            .angle
            .offset(if forward { -delta } else { delta });
        self.state.speed = flip(next.speed);
        self.state.current = flip(next.current);
    }

    fn counts(&self, mdeg: i64) -> i32 {
        saturate((mdeg as i128 * self.counts_per_degree.raw() as i128 / (1000 * 65536)) as i64)
    }
}

/// One simulated motor; clones share the same plant
#[derive(Clone)]
pub struct SimMotor {
    plant: Arc<Mutex<Plant>>,
}

impl SimMotor {
    pub fn new(model: ObserverModel, counts_per_degree: Fix16) -> Self {
        Self {
            plant: Arc::new(Mutex::new(Plant {
                model,
                state: ModelState::default(),
                actuation: Actuation::Coast,
                counts_per_degree,
                absolute: false,
                blocked: false,
                time: None,
            })),
        }
    }

    /// Start the shaft at `angle`
    pub fn with_angle(self, angle: Angle) -> Self {
        if let Ok(mut plant) = self.plant.lock() {
            plant.state.angle = angle;
        }
        self
    }

    /// Report the absolute position within one rotation
    pub fn with_absolute_encoder(self) -> Self {
        if let Ok(mut plant) = self.plant.lock() {
            plant.absolute = true;
        }
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Plant>> {
        self.plant.lock().map_err(|_| Error::Io)
    }

    /// Hold the shaft still, as if mechanically blocked
    pub fn set_blocked(&self, blocked: bool) {
        if let Ok(mut plant) = self.plant.lock() {
            plant.blocked = blocked;
        }
    }

    /// Shaft angle, hardware frame
    pub fn angle(&self) -> Angle {
        self.plant
            .lock()
            .map(|plant| plant.state.angle)
            .unwrap_or_default()
    }

    /// Shaft speed in mdeg/s, hardware frame
    pub fn speed(&self) -> i32 {
        self.plant
            .lock()
            .map(|plant| plant.state.speed)
            .unwrap_or_default()
    }

    /// Last actuation received, hardware frame
    pub fn actuation(&self) -> Actuation {
        self.plant
            .lock()
            .map(|plant| plant.actuation)
            .unwrap_or_default()
    }

    /// Step the plant up to `time`, one tick at a time
    fn advance(&self, time: u32) -> Result<()> {
        let mut plant = self.lock()?;
        let last = *plant.time.get_or_insert(time);
        let ticks = time.wrapping_sub(last) / LOOP_TIME_MS;
        for _ in 0..ticks {
            plant.step();
        }
        plant.time = Some(last.wrapping_add(ticks * LOOP_TIME_MS));
        Ok(())
    }
}

impl Counter for SimMotor {
    fn count(&mut self) -> Result<i32> {
        let plant = self.lock()?;
        Ok(plant.counts(plant.state.angle.to_mdeg()))
    }

    fn abs_count(&mut self) -> Result<i32> {
        let plant = self.lock()?;
        if !plant.absolute {
            return Err(Error::NotSupported);
        }
        let within = plant.state.angle.millidegrees() as i64;
        // Report in [-180, 180) like an absolute encoder would
        let centered = if within >= MDEG_PER_ROTATION as i64 / 2 {
            within - MDEG_PER_ROTATION as i64
        } else {
            within
        };
        Ok(plant.counts(centered))
    }

    fn rate(&mut self) -> Result<i32> {
        let plant = self.lock()?;
        Ok(plant.counts(plant.state.speed as i64))
    }
}

impl Actuator for SimMotor {
    fn actuate(&mut self, actuation: Actuation) -> Result<()> {
        self.lock()?.actuation = actuation;
        Ok(())
    }
}

/// Simulated hardware with a motor slot per device id
pub struct SimHardware {
    motors: [Option<SimMotor>; NUM_MOTOR_PORTS],
}

impl SimHardware {
    pub fn new() -> Self {
        Self {
            motors: Default::default(),
        }
    }

    /// Plug `motor` into slot `id`; ids beyond the last slot are ignored
    pub fn attach(&mut self, id: u8, motor: SimMotor) {
        if let Some(slot) = self.motors.get_mut(id as usize) {
            debug!("Simulated motor plugged into slot {}", id);
            *slot = Some(motor);
        }
    }

    pub fn motor(&self, id: u8) -> Option<&SimMotor> {
        self.motors.get(id as usize).and_then(Option::as_ref)
    }

    fn slot(&self, id: u8) -> Result<SimMotor> {
        self.motor(id).cloned().ok_or(Error::NoDevice)
    }
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for SimHardware {
    fn counter(&mut self, id: u8) -> Result<Box<dyn Counter>> {
        Ok(Box::new(self.slot(id)?))
    }

    fn actuator(&mut self, id: u8) -> Result<Box<dyn Actuator>> {
        Ok(Box::new(self.slot(id)?))
    }

    fn poll(&mut self, time: u32) -> Result<()> {
        for motor in self.motors.iter().flatten() {
            motor.advance(time)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MODEL_MEDIUM_MOTOR;

    fn motor() -> SimMotor {
        SimMotor::new(MODEL_MEDIUM_MOTOR, Fix16::from_int(2))
    }

    #[test]
    fn test_missing_slot_is_no_device() {
        let mut hardware = SimHardware::new();
        assert!(matches!(hardware.counter(0), Err(Error::NoDevice)));
        assert!(matches!(hardware.actuator(5), Err(Error::NoDevice)));
        hardware.attach(9, motor());
        assert!(hardware.motor(9).is_none());
    }

    #[test]
    fn test_voltage_spins_plant_and_counts() {
        let mut hardware = SimHardware::new();
        let sim = motor();
        hardware.attach(1, sim.clone());
        let mut counter = hardware.counter(1).unwrap();
        let mut actuator = hardware.actuator(1).unwrap();

        hardware.poll(0).unwrap();
        actuator.actuate(Actuation::Voltage(6000)).unwrap();
        hardware.poll(1000).unwrap();

        assert!(sim.speed() > 500_000);
        let count = counter.count().unwrap();
        assert_eq!(count as i64, sim.angle().to_mdeg() * 2 / 1000);
        assert!(counter.rate().unwrap() > 1000);

        actuator.actuate(Actuation::Voltage(-6000)).unwrap();
        hardware.poll(3000).unwrap();
        assert!(sim.speed() < -500_000);
    }

    #[test]
    fn test_plant_rests_without_input() {
        let mut hardware = SimHardware::new();
        let sim = motor();
        hardware.attach(0, sim.clone());
        hardware.poll(0).unwrap();
        hardware.poll(2000).unwrap();
        assert_eq!(sim.angle(), Angle::ZERO);
        assert_eq!(sim.speed(), 0);

        // Spin up, then coast back to rest without reversing
        hardware.actuator(0).unwrap().actuate(Actuation::Voltage(3000)).unwrap();
        hardware.poll(2500).unwrap();
        hardware.actuator(0).unwrap().actuate(Actuation::Coast).unwrap();
        let mut previous = sim.angle();
        for step in 1..=100 {
            hardware.poll(2500 + step * LOOP_TIME_MS).unwrap();
            assert!(sim.speed() >= 0);
            assert!(sim.angle() >= previous);
            previous = sim.angle();
        }
        assert_eq!(sim.speed(), 0);
    }

    #[test]
    fn test_blocked_plant_does_not_move() {
        let mut hardware = SimHardware::new();
        let sim = motor();
        hardware.attach(0, sim.clone());
        sim.set_blocked(true);
        hardware.poll(0).unwrap();
        hardware.actuator(0).unwrap().actuate(Actuation::Voltage(9000)).unwrap();
        hardware.poll(500).unwrap();
        assert_eq!(sim.angle(), Angle::ZERO);
        assert_eq!(sim.actuation(), Actuation::Voltage(9000));
    }

    #[test]
    fn test_absolute_count_is_centered() {
        let mut sim = motor()
            .with_angle(Angle::from_degrees(2 * 360 + 270))
            .with_absolute_encoder();
        assert_eq!(sim.abs_count().unwrap(), -180);
        assert_eq!(sim.count().unwrap(), (2 * 360 + 270) * 2);
        assert!(matches!(motor().abs_count(), Err(Error::NotSupported)));
    }
}
