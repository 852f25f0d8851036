//! Majority-vote debouncing of a single digital line

/// Transition of the confirmed level produced by one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    None,
    Rising,
    Falling,
}

/// 3-sample sliding window; `confirmed` is true iff at least 2 samples are true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebouncedInput {
    samples: [bool; 3],
    confirmed: bool,
}

impl DebouncedInput {
    pub const fn new() -> Self {
        Self {
            samples: [false; 3],
            confirmed: false,
        }
    }

    /// Shift in a raw sample and return the resulting edge, if any.
    pub fn update(&mut self, raw: bool) -> Edge {
        self.samples = [self.samples[1], self.samples[2], raw];
        let highs = self.samples.iter().filter(|&&s| s).count();
        let next = highs >= 2;

        let edge = match (self.confirmed, next) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => Edge::None,
        };
        self.confirmed = next;
        edge
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn samples(&self) -> [bool; 3] {
        self.samples
    }
}
