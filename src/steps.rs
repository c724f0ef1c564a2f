//! Address resolution steps.
//!
//! A signature often matches an instruction that *references* the function of
//! interest (a `call rel32`, a `lea reg, [rip+disp32]`) rather than its entry
//! point. Steps walk from the match to the real target:
//!
//! * kind `0`, [`Step::RipRelative`]: read the `i32` displacement at
//!   `addr + operand` and continue at `addr + operand + 4 + disp`.
//! * kind `1`, [`Step::Offset`]: continue at `addr + operand`.
//!
//! Addresses are raw file offsets. Displacements are applied in raw space,
//! which matches the virtual layout as long as source and target share a
//! section.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Error;
use crate::image::PeImage;

/// Bytes of a `rel32`/`disp32` field; the CPU adds it on top of the displacement.
const DISP32_SIZE: i64 = 4;

/// One resolution step.
///
/// Serialized as a `[kind, operand]` pair; kinds outside `{0, 1}` are rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(i64, i64)", into = "(i64, i64)")]
pub enum Step {
    /// Follow a RIP-relative displacement stored `operand` bytes into the instruction.
    RipRelative(i64),
    /// Add `operand` to the address.
    Offset(i64),
}

impl Step {
    pub fn kind(&self) -> i64 {
        match self {
            Step::RipRelative(_) => 0,
            Step::Offset(_) => 1,
        }
    }

    pub fn operand(&self) -> i64 {
        match self {
            Step::RipRelative(op) | Step::Offset(op) => *op,
        }
    }

    /// Apply this step to `addr`, or `None` if the result leaves the image.
    pub fn apply(&self, image: &PeImage, addr: usize) -> Option<usize> {
        let addr = i64::try_from(addr).ok()?;

        let next = match *self {
            Step::RipRelative(operand) => {
                let disp_at = addr.checked_add(operand)?;
                let disp = image.read::<i32>(usize::try_from(disp_at).ok()?).ok()?;
                disp_at
                    .checked_add(DISP32_SIZE)?
                    .checked_add(disp as i64)?
            }
            Step::Offset(operand) => addr.checked_add(operand)?,
        };

        let next = usize::try_from(next).ok()?;
        image.is_in_bounds(next).then_some(next)
    }
}

impl TryFrom<(i64, i64)> for Step {
    type Error = Error;

    fn try_from((kind, operand): (i64, i64)) -> Result<Self, Error> {
        match kind {
            0 => Ok(Step::RipRelative(operand)),
            1 => Ok(Step::Offset(operand)),
            other => Err(Error::InvalidStepKind(other)),
        }
    }
}

impl From<Step> for (i64, i64) {
    fn from(step: Step) -> Self {
        (step.kind(), step.operand())
    }
}

impl std::str::FromStr for Step {
    type Err = Error;

    /// Parse `"KIND,OPERAND"`, e.g. `"0,3"`. The operand may be hex (`0x10`).
    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidStep(s.to_string());

        let (kind, operand) = s.split_once(',').ok_or_else(invalid)?;
        let kind: i64 = kind.trim().parse().map_err(|_| invalid())?;
        let operand = parse_int(operand.trim()).ok_or_else(invalid)?;
        Step::try_from((kind, operand))
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Apply `steps` in order starting from the raw offset `start`.
///
/// Stops at the first step whose result falls outside the image; the remaining
/// steps are not evaluated.
pub fn apply_steps(image: &PeImage, start: usize, steps: &[Step]) -> Option<usize> {
    steps.iter().enumerate().try_fold(start, |addr, (i, step)| {
        let next = step.apply(image, addr);
        trace!(
            step = i,
            kind = step.kind(),
            operand = step.operand(),
            from = addr,
            to = ?next,
            "applied step"
        );
        next
    })
}
