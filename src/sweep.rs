//! The search loop: try every glitch timing in turn until one gets us past
//! the protection, then dump the flash.

use std::{
    fmt,
    io::Write,
    path::PathBuf,
    str::FromStr,
};

use enum_map::{Enum, EnumMap};
use indicatif::ProgressBar;

use crate::{
    boot::{BootSession, Handshake},
    layout::MemoryBlock,
    link::{self, Link},
    reader::{FlashImage, FlashReader},
    trigger::GlitchTrigger,
    Error, Failure, OurContext, TargetProfile, Timing,
};

/// Pulse generator settings for one attempt, in pulse generator clock
/// cycles.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GlitchParameters {
    pub delay: u32,
    pub width: u32,
}

impl fmt::Display for GlitchParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delay {} width {}", self.delay, self.width)
    }
}

impl FromStr for GlitchParameters {
    type Err = String;

    /// `DELAY,WIDTH`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (delay, width) = s.split_once(',')
            .ok_or_else(|| format!("expected DELAY,WIDTH, got {s:?}"))?;
        Ok(GlitchParameters {
            delay: parse_int::parse::<u32>(delay.trim()).map_err(|e| format!("bad delay: {e}"))?,
            width: parse_int::parse::<u32>(width.trim()).map_err(|e| format!("bad width: {e}"))?,
        })
    }
}

/// A half-open range with a step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SweepRange {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

impl SweepRange {
    pub fn values(self) -> impl Iterator<Item = u32> + Clone {
        (self.start..self.end).step_by(self.step as usize)
    }

    pub fn contains(self, v: u32) -> bool {
        (self.start..self.end).contains(&v) && (v - self.start) % self.step == 0
    }
}

impl FromStr for SweepRange {
    type Err = String;

    /// `START..END` or `START..END:STEP`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (range, step) = match s.split_once(':') {
            Some((range, step)) => (range, parse_int::parse::<u32>(step.trim()).map_err(|e| format!("bad step: {e}"))?),
            None => (s, 1),
        };
        let (start, end) = range.split_once("..")
            .ok_or_else(|| format!("expected START..END[:STEP], got {s:?}"))?;
        let start = parse_int::parse::<u32>(start.trim()).map_err(|e| format!("bad start: {e}"))?;
        let end = parse_int::parse::<u32>(end.trim()).map_err(|e| format!("bad end: {e}"))?;
        if step == 0 {
            return Err("step can't be zero".into());
        }
        if start >= end {
            return Err(format!("empty range {start}..{end}"));
        }
        Ok(SweepRange { start, end, step })
    }
}

/// The order parameters get tried in: delay outer, width inner. Fixed, so a
/// run can pick up after the last pair an earlier one tried.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SweepPlan {
    pub delay: SweepRange,
    pub width: SweepRange,
    resume_after: Option<GlitchParameters>,
}

impl SweepPlan {
    pub fn new(delay: SweepRange, width: SweepRange) -> Self {
        SweepPlan { delay, width, resume_after: None }
    }

    /// A plan with just the one pair in it.
    pub fn single(params: GlitchParameters) -> Result<Self, Error> {
        let one = |v: u32| {
            let end = v.checked_add(1)
                .ok_or_else(|| Error::Profile(format!("{v} is too large for a sweep").into()))?;
            Ok::<_, Error>(SweepRange { start: v, end, step: 1 })
        };
        Ok(SweepPlan::new(one(params.delay)?, one(params.width)?))
    }

    /// Skips everything up to and including `last`.
    pub fn resume_after(mut self, last: GlitchParameters) -> Result<Self, Error> {
        if !self.delay.contains(last.delay) || !self.width.contains(last.width) {
            return Err(Error::Profile(format!("{last} is not part of the sweep").into()));
        }
        self.resume_after = Some(last);
        Ok(self)
    }

    pub fn params(&self) -> impl Iterator<Item = GlitchParameters> {
        let widths = self.width;
        let all = self.delay.values().flat_map(move |delay| {
            widths.values().map(move |width| GlitchParameters { delay, width })
        });
        let resume_after = self.resume_after;
        let mut skipping = resume_after.is_some();
        all.filter(move |p| {
            if skipping {
                skipping = Some(*p) != resume_after;
                return false;
            }
            true
        })
    }

    pub fn len(&self) -> usize {
        self.params().count()
    }
}

/// How an attempt went.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
pub enum Outcome {
    /// No reset echo, or the control port itself failed; the control
    /// channel was reopened.
    ChannelDropped,
    /// Some answer we didn't expect. The glitch probably hit something else.
    LinkDesync,
    /// The part cleanly refused us. The glitch missed.
    ProtectionHeld,
    /// We got in.
    Unlocked,
}

#[derive(Debug)]
pub enum SweepEnd {
    /// Got in and read everything.
    Dumped {
        params: GlitchParameters,
        session: BootSession,
        bytes: u64,
    },
    /// Got in, but the link fell over partway through the dump. What was read
    /// before that is on disk.
    Partial {
        params: GlitchParameters,
        bytes: u64,
        error: Error,
    },
    /// Ran out of parameters.
    Exhausted,
}

/// Where the dump goes.
#[derive(Clone, Debug)]
pub struct Output {
    pub path: PathBuf,
    /// Keep the complete blocks of an existing image and read only the rest.
    pub resume: bool,
}

/// Drives the whole thing. Owns the control channel; nothing else gets to
/// reopen it.
pub struct Sweep<'p, L, P, F>
    where L: Link,
          P: Write,
          F: FnMut() -> Result<L, Error>,
{
    control: L,
    reopen: F,
    trigger: GlitchTrigger<P>,
    profile: &'p TargetProfile,
    blocks: Vec<MemoryBlock>,
    timing: Timing,
    output: Output,
    progress: ProgressBar,
    tally: EnumMap<Outcome, usize>,
    last_tried: Option<GlitchParameters>,
}

impl<'p, L, P, F> Sweep<'p, L, P, F>
    where L: Link,
          P: Write,
          F: FnMut() -> Result<L, Error>,
{
    pub fn new(
        control: L,
        reopen: F,
        pulse: P,
        profile: &'p TargetProfile,
        timing: Timing,
        output: Output,
    ) -> Result<Self, Error> {
        let blocks = profile.layout.blocks()?;
        Ok(Sweep {
            control,
            reopen,
            trigger: GlitchTrigger::new(pulse, timing.settle, timing.cooldown),
            profile,
            blocks,
            timing,
            output,
            progress: ProgressBar::hidden(),
            tally: EnumMap::default(),
            last_tried: None,
        })
    }

    /// Shows dump progress on this bar. Its length is set when the dump
    /// starts.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = bar;
        self
    }

    pub fn tally(&self) -> &EnumMap<Outcome, usize> {
        &self.tally
    }

    pub fn last_tried(&self) -> Option<GlitchParameters> {
        self.last_tried
    }

    /// Tries parameters from `plan` in order until one unlocks the part, then
    /// dumps it. Leaves the target in reset however it ends.
    pub fn run(&mut self, plan: &SweepPlan) -> Result<SweepEnd, Error> {
        self.trigger.hold(&mut self.control)?;
        let result = self.run_inner(plan);
        if let Err(e) = self.trigger.hold(&mut self.control) {
            log::warn!("couldn't put target back in reset: {e}");
        }
        result
    }

    fn run_inner(&mut self, plan: &SweepPlan) -> Result<SweepEnd, Error> {
        for params in plan.params() {
            self.last_tried = Some(params);
            let (outcome, end) = self.attempt(params)
                .with_context(|| format!("attempt with {params}"))?;
            self.tally[outcome] += 1;
            if let Some(end) = end {
                return Ok(end);
            }
        }
        Ok(SweepEnd::Exhausted)
    }

    /// One pass of reset, handshake and (if we get in) dump. Only errors
    /// that make carrying on pointless come back as `Err`.
    fn attempt(&mut self, params: GlitchParameters) -> Result<(Outcome, Option<SweepEnd>), Error> {
        let armed = link::drain(&mut self.control)
            .and_then(|_| self.trigger.arm(&mut self.control, params));
        if let Err(e) = armed {
            return self.channel_lost(params, e);
        }

        let mut handshake = Handshake::new(&mut self.control, self.profile);
        if let Err(e) = handshake.probe() {
            return self.channel_lost(params, e);
        }

        let session = match handshake.run() {
            Ok(session) => session,
            Err(Error::HandshakeFailed { stage, cause }) => {
                let outcome = match cause {
                    Failure::ProtectionHeld => Outcome::ProtectionHeld,
                    Failure::Unexpected(_) => Outcome::LinkDesync,
                };
                log::info!("{params}: failed at {stage}: {cause}");
                self.trigger.disarm(&mut self.control)?;
                return Ok((outcome, None));
            }
            Err(e) => return Err(e),
        };

        log::info!(
            "{params}: unlocked! system clock {} Hz, peripheral clock {} Hz",
            session.clocks.system_hz,
            session.clocks.peripheral_hz,
        );
        let end = self.dump(params, session)?;
        Ok((Outcome::Unlocked, Some(end)))
    }

    fn dump(&mut self, params: GlitchParameters, session: BootSession) -> Result<SweepEnd, Error> {
        let (mut image, done) = if self.output.resume {
            FlashImage::resume(&self.output.path, &self.blocks)?
        } else {
            (FlashImage::create(&self.output.path)?, 0)
        };
        if done > 0 {
            log::info!("{}: {done} blocks already present, continuing", image.path().display());
        }

        self.progress.set_length(self.profile.layout.total_size());
        self.progress.set_position(image.len());

        let result = FlashReader::new(&mut self.control, self.timing, &self.progress)
            .read_all(&self.blocks[done..], &mut image);
        let bytes = image.finish()?;

        match result {
            Ok(()) => {
                self.progress.finish();
                Ok(SweepEnd::Dumped { params, session, bytes })
            }
            Err(error @ Error::BlockReadFailed { .. }) => {
                self.progress.abandon();
                log::warn!("{params}: dump stopped after {bytes} bytes: {error}");
                Ok(SweepEnd::Partial { params, bytes, error })
            }
            Err(e) => Err(e),
        }
    }

    /// Anything that went wrong up to and including the reset echo. A dead
    /// control channel (no echo, or the port itself erroring) gets reopened
    /// and the sweep moves on; the rest is fatal.
    fn channel_lost(
        &mut self,
        params: GlitchParameters,
        error: Error,
    ) -> Result<(Outcome, Option<SweepEnd>), Error> {
        if !error.is_channel_failure() {
            return Err(error);
        }
        match error.root() {
            Error::ControlChannelDropped { observed } => {
                log::warn!("{params}: no reset echo (got {observed:02x?}), reopening control channel");
            }
            root => log::warn!("{params}: control channel failed ({error}: {root}), reopening it"),
        }
        self.reopen_control()?;
        Ok((Outcome::ChannelDropped, None))
    }

    fn reopen_control(&mut self) -> Result<(), Error> {
        self.control = (self.reopen)().context("reopening control channel")?;
        self.trigger.hold(&mut self.control)?;
        link::drain(&mut self.control)?;
        Ok(())
    }
}
