pub const DEFAULT_ROUND_SECS: u32 = 300;
pub const DEFAULT_REST_SECS: u32 = 60;
pub const ROUND_PRESETS_MINUTES: [u32; 4] = [5, 6, 7, 10];
pub const REST_PRESETS_SECS: [u32; 3] = [30, 60, 90];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Rolling,
    Resting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Played when the timer starts.
    ShortBeep,
    /// Played on every switch between rolling and resting.
    LongBeep,
    PhaseChanged(Phase),
}

/// Round timer for rolling sessions, advanced one second per `tick`.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    round_secs: u32,
    rest_secs: u32,
    time_left: u32,
    phase: Phase,
    round: u32,
    running: bool,
    sound: bool,
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self::new(DEFAULT_ROUND_SECS, DEFAULT_REST_SECS)
    }
}

impl IntervalTimer {
    pub fn new(round_secs: u32, rest_secs: u32) -> Self {
        Self {
            round_secs,
            rest_secs,
            time_left: round_secs,
            phase: Phase::Rolling,
            round: 1,
            running: false,
            sound: true,
        }
    }

    pub fn time_left(&self) -> u32 {
        self.time_left
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn round_secs(&self) -> u32 {
        self.round_secs
    }

    pub fn rest_secs(&self) -> u32 {
        self.rest_secs
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound
    }

    pub fn toggle_sound(&mut self) {
        self.sound = !self.sound;
    }

    fn beep(&self, event: TimerEvent, events: &mut Vec<TimerEvent>) {
        if self.sound {
            events.push(event);
        }
    }

    pub fn toggle(&mut self) -> Vec<TimerEvent> {
        self.running = !self.running;
        let mut events = Vec::new();
        if self.running {
            self.beep(TimerEvent::ShortBeep, &mut events);
        }
        events
    }

    pub fn reset(&mut self) {
        self.running = false;
        self.phase = Phase::Rolling;
        self.round = 1;
        self.time_left = self.round_secs;
    }

    /// The display only follows when idle in a rolling phase.
    pub fn set_round_time(&mut self, secs: u32) {
        self.round_secs = secs;
        if !self.running && self.phase == Phase::Rolling {
            self.time_left = secs;
        }
    }

    pub fn set_rest_time(&mut self, secs: u32) {
        self.rest_secs = secs;
    }

    pub fn tick(&mut self) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        if !self.running {
            return events;
        }

        self.time_left = self.time_left.saturating_sub(1);
        if self.time_left > 0 {
            return events;
        }

        self.beep(TimerEvent::LongBeep, &mut events);
        match self.phase {
            Phase::Resting => {
                self.phase = Phase::Rolling;
                self.time_left = self.round_secs;
                self.round += 1;
            }
            Phase::Rolling => {
                self.phase = Phase::Resting;
                self.time_left = self.rest_secs;
            }
        }
        events.push(TimerEvent::PhaseChanged(self.phase));
        events
    }

    pub fn display(&self) -> String {
        format(self.time_left)
    }
}

/// `m:ss`.
pub fn format(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_padded_seconds() {
        assert_eq!(format(300), "5:00");
        assert_eq!(format(65), "1:05");
        assert_eq!(format(9), "0:09");
    }

    #[test]
    fn idle_timer_does_not_move() {
        let mut timer = IntervalTimer::default();
        assert!(timer.tick().is_empty());
        assert_eq!(timer.time_left(), DEFAULT_ROUND_SECS);
    }

    #[test]
    fn starting_beeps_short() {
        let mut timer = IntervalTimer::default();
        assert_eq!(timer.toggle(), vec![TimerEvent::ShortBeep]);
        assert!(timer.toggle().is_empty());
        assert!(!timer.is_running());
    }

    #[test]
    fn rounds_alternate_with_rest() {
        let mut timer = IntervalTimer::new(3, 2);
        timer.toggle();

        timer.tick();
        timer.tick();
        let events = timer.tick();
        assert_eq!(
            events,
            vec![TimerEvent::LongBeep, TimerEvent::PhaseChanged(Phase::Resting)]
        );
        assert_eq!(timer.time_left(), 2);
        assert_eq!(timer.round(), 1);

        timer.tick();
        let events = timer.tick();
        assert_eq!(events[1], TimerEvent::PhaseChanged(Phase::Rolling));
        assert_eq!(timer.round(), 2);
        assert_eq!(timer.time_left(), 3);
    }

    #[test]
    fn muted_timer_still_switches_phase() {
        let mut timer = IntervalTimer::new(1, 1);
        timer.toggle_sound();
        assert!(timer.toggle().is_empty());
        assert_eq!(timer.tick(), vec![TimerEvent::PhaseChanged(Phase::Resting)]);
    }

    #[test]
    fn round_preset_updates_display_only_when_idle_and_rolling() {
        let mut timer = IntervalTimer::default();
        timer.set_round_time(ROUND_PRESETS_MINUTES[3] * 60);
        assert_eq!(timer.display(), "10:00");

        timer.toggle();
        timer.set_round_time(360);
        assert_eq!(timer.time_left(), 600);
        assert_eq!(timer.round_secs(), 360);

        timer.reset();
        assert_eq!(timer.display(), "6:00");
        assert!(!timer.is_running());
    }
}
