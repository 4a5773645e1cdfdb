//! Reset line handling and the pulse generator.
//!
//! The pulse generator is a separate microcontroller that watches the boot
//! UART for the synchronize command and fires a pulse of `width` cycles,
//! `delay` cycles after it. It takes its parameters as a line of text and
//! never answers.

use std::{io::Write, time::Duration};

use crate::{link::Link, Error, GlitchParameters, OurContext};

pub struct GlitchTrigger<P: Write> {
    pulse: P,
    settle: Duration,
    cooldown: Duration,
    armed: bool,
}

impl<P: Write> GlitchTrigger<P> {
    pub fn new(pulse: P, settle: Duration, cooldown: Duration) -> Self {
        GlitchTrigger { pulse, settle, cooldown, armed: false }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Loads `params` into the pulse generator, lets the target out of reset
    /// and waits for it to settle into its boot ROM.
    pub fn arm<L: Link + ?Sized>(&mut self, link: &mut L, params: GlitchParameters) -> Result<(), Error> {
        writeln!(self.pulse, "{} {}", params.delay, params.width)
            .and_then(|()| self.pulse.flush())
            .map_err(Error::Pulse)
            .with_context(|| format!("sending {params} to pulse generator"))?;

        link.set_reset_released(true)?;
        self.armed = true;
        sleep(self.settle);
        Ok(())
    }

    /// Puts the target back in reset and waits out the cooldown, which
    /// bounds how often the pulse generator fires. Safe to call when already
    /// disarmed.
    pub fn disarm<L: Link + ?Sized>(&mut self, link: &mut L) -> Result<(), Error> {
        if self.armed {
            link.set_reset_released(false)?;
            self.armed = false;
        }
        sleep(self.cooldown);
        Ok(())
    }

    /// Forces the target into reset regardless of what we think the line is
    /// doing. Used on a freshly opened channel, whose line state we don't
    /// know.
    pub fn hold<L: Link + ?Sized>(&mut self, link: &mut L) -> Result<(), Error> {
        link.set_reset_released(false)?;
        self.armed = false;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pulse(&self) -> &P {
        &self.pulse
    }
}

fn sleep(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}
