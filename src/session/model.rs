//! Observable state of one capture session
//!
//! Controller-owned values (volumes, thresholds, mute) live in the session's
//! settings and are pushed into the Shared Control Block on every write.
//! Worker-owned values (format, metering) are cached from poll snapshots.

use std::sync::Arc;

use uuid::Uuid;

use super::SessionId;
use crate::config::SessionSettings;
use crate::constants::MONITOR_SLOTS;
use crate::shm::{Channel, ControlBlock, ControlSnapshot, Flag};
use crate::worker::Console;

/// One capture session as seen by the controller
pub struct Session {
    id: SessionId,
    settings: SessionSettings,
    control: Arc<ControlBlock>,
    console: Console,
    name: Option<String>,
    valid: bool,
    can_swap: bool,
    sample_rate: u32,
    channel_mask: u32,
    last_tick: Option<u64>,
    monitor: [f32; MONITOR_SLOTS],
    monitor_next: usize,
    last_cursor: usize,
    cursor_delta: u32,
}

impl Session {
    /// Wrap a freshly created block and write the settings into it
    pub fn new(
        id: SessionId,
        settings: SessionSettings,
        control: Arc<ControlBlock>,
        console: Console,
    ) -> Self {
        let last_cursor = control.tap_write_cursor();
        let session = Self {
            id,
            settings,
            control,
            console,
            name: None,
            valid: false,
            can_swap: false,
            sample_rate: 0,
            channel_mask: 0,
            last_tick: None,
            monitor: [0.0; MONITOR_SLOTS],
            monitor_next: 0,
            last_cursor,
            cursor_delta: 0,
        };
        session.initialize_block();
        session
    }

    fn initialize_block(&self) {
        let control = &self.control;
        let settings = &self.settings;

        control.set_flag(Flag::Enabled, !settings.muted);
        control.set_master_volume(self.raw_master_volume());
        for channel in Channel::iter_mask(u32::MAX) {
            control.set_channel_volume(channel, settings.channel_volume(channel.index()) as f32);
        }
        control.set_saturation_threshold(settings.saturation_threshold as f32);
        control.set_silence_threshold(settings.silence_threshold as f32);
        control.set_averaging_weight(settings.averaging_weight as f32);
        control.set_saturation_debounce_factor(settings.saturation_debounce_factor as f32);
        control.set_saturation_recovery_factor(settings.saturation_recovery_factor as f32);
        control.set_saturation_effective_volume(1.0);
        control.set_saturation_debounce_volume(1.0);
        control.set_flag(Flag::Initialized, true);
    }

    fn raw_master_volume(&self) -> f32 {
        (self.settings.master_volume * self.settings.max_master_volume) as f32
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn persistent_id(&self) -> Uuid {
        self.settings.id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub(crate) fn settings_mut(&mut self) -> &mut SessionSettings {
        &mut self.settings
    }

    pub fn control(&self) -> &Arc<ControlBlock> {
        &self.control
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Friendly name of the resolved source device
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether every configured device resolved, so a worker may run
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Whether the source follows the default console render device
    pub fn can_swap(&self) -> bool {
        self.can_swap
    }

    pub(crate) fn set_resolution(&mut self, valid: bool, name: Option<String>, can_swap: bool) {
        self.valid = valid;
        self.name = name;
        self.can_swap = can_swap;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_mask(&self) -> u32 {
        self.channel_mask
    }

    /// Channels the worker currently reports, lowest bit first
    pub fn channels(&self) -> impl Iterator<Item = Channel> {
        Channel::iter_mask(self.channel_mask)
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.channel_mask & channel.bits() != 0
    }

    pub fn color(&self) -> u32 {
        self.settings.color
    }

    pub fn set_color(&mut self, color: u32) {
        self.settings.color = color & 0xFF_FF_FF;
    }

    /// Master volume normalised to `0..=1` of the session's maximum
    pub fn master_volume(&self) -> f64 {
        self.settings.master_volume
    }

    pub fn set_master_volume(&mut self, volume: f64) {
        self.settings.master_volume = volume.clamp(0.0, 1.0);
        self.control.set_master_volume(self.raw_master_volume());
    }

    pub fn max_master_volume(&self) -> f64 {
        self.settings.max_master_volume
    }

    pub fn set_max_master_volume(&mut self, volume: f64) {
        self.settings.max_master_volume = volume.max(0.0);
        self.control.set_master_volume(self.raw_master_volume());
    }

    pub fn muted(&self) -> bool {
        self.settings.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.settings.muted = muted;
        self.control.set_flag(Flag::Enabled, !muted);
    }

    pub fn saturation_threshold(&self) -> f64 {
        self.settings.saturation_threshold
    }

    pub fn set_saturation_threshold(&mut self, value: f64) {
        self.settings.saturation_threshold = value;
        self.control.set_saturation_threshold(value as f32);
    }

    pub fn silence_threshold(&self) -> f64 {
        self.settings.silence_threshold
    }

    pub fn set_silence_threshold(&mut self, value: f64) {
        self.settings.silence_threshold = value;
        self.control.set_silence_threshold(value as f32);
    }

    pub fn averaging_weight(&self) -> f64 {
        self.settings.averaging_weight
    }

    pub fn set_averaging_weight(&mut self, value: f64) {
        self.settings.averaging_weight = value;
        self.control.set_averaging_weight(value as f32);
    }

    pub fn saturation_debounce_factor(&self) -> f64 {
        self.settings.saturation_debounce_factor
    }

    pub fn set_saturation_debounce_factor(&mut self, value: f64) {
        self.settings.saturation_debounce_factor = value;
        self.control.set_saturation_debounce_factor(value as f32);
    }

    pub fn saturation_recovery_factor(&self) -> f64 {
        self.settings.saturation_recovery_factor
    }

    pub fn set_saturation_recovery_factor(&mut self, value: f64) {
        self.settings.saturation_recovery_factor = value;
        self.control.set_saturation_recovery_factor(value as f32);
    }

    pub fn channel_volume(&self, channel: Channel) -> f64 {
        self.settings.channel_volume(channel.index())
    }

    pub fn set_channel_volume(&mut self, channel: Channel, volume: f64) {
        let volume = volume.max(0.0);
        self.settings.set_channel_volume(channel.index(), volume);
        self.control.set_channel_volume(channel, volume as f32);
    }

    /// Fold one poll sample into the cached worker state
    pub fn apply_snapshot(&mut self, snapshot: &ControlSnapshot) {
        self.sample_rate = snapshot.sample_rate;
        self.channel_mask = snapshot.channel_mask;

        if self.last_tick != Some(snapshot.last_frame_tick_count) {
            self.last_tick = Some(snapshot.last_frame_tick_count);
            self.monitor[self.monitor_next] = snapshot.last_frame_max_amplitude
                * snapshot.saturation_effective_volume
                * snapshot.master_volume;
            self.monitor_next = (self.monitor_next + 1) % MONITOR_SLOTS;
        }
    }

    /// Recent peak level, normalised like the master volume
    pub fn monitor_volume(&self) -> f64 {
        if self.settings.muted {
            return 0.0;
        }
        let peak = self.monitor.iter().copied().fold(0.0f32, f32::max) as f64;
        let meter = if self.settings.max_master_volume > 0.0 {
            peak / self.settings.max_master_volume
        } else {
            0.0
        };
        self.settings.master_volume.min(meter)
    }

    /// Sample the tap write cursor and record how far it moved
    pub fn update_cursor(&mut self) {
        let capacity = self.control.tap_capacity();
        let cursor = self.control.tap_write_cursor();
        self.cursor_delta = if capacity == 0 || cursor == self.last_cursor {
            0
        } else {
            ((cursor + capacity - self.last_cursor) % capacity) as u32
        };
        self.last_cursor = cursor;
    }

    /// Bytes written to the tap between the last two cursor samples
    pub fn tap_write_cursor_delta(&self) -> u32 {
        self.cursor_delta
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("persistent_id", &self.settings.id)
            .field("name", &self.name)
            .field("valid", &self.valid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(settings: SessionSettings) -> Session {
        let control = Arc::new(ControlBlock::anonymous(64).unwrap());
        Session::new(1, settings, control, Console::new(4))
    }

    fn snapshot(tick: u64, amplitude: f32, master: f32) -> ControlSnapshot {
        ControlSnapshot {
            sample_rate: 48000,
            channel_mask: 0b11,
            channel_volumes: [1.0; 32],
            master_volume: master,
            saturation_effective_volume: 1.0,
            last_frame_tick_count: tick,
            last_frame_max_amplitude: amplitude,
            tap_write_cursor: 0,
        }
    }

    #[test]
    fn test_new_session_initializes_block() {
        let mut settings = SessionSettings::create_new();
        settings.muted = true;
        settings.master_volume = 0.5;
        settings.max_master_volume = 2.0;
        settings.set_channel_volume(1, 0.25);
        let session = session(settings);
        let control = session.control();

        assert!(control.flag(Flag::Initialized));
        assert!(!control.flag(Flag::Enabled));
        assert_eq!(control.master_volume(), 1.0);
        assert_eq!(control.channel_volume(Channel::FRONT_RIGHT), 0.25);
        assert_eq!(control.saturation_effective_volume(), 1.0);
        assert_eq!(control.saturation_debounce_volume(), 1.0);
        assert!(control.saturation_threshold().is_infinite());
    }

    #[test]
    fn test_master_volume_scales_with_maximum() {
        let mut session = session(SessionSettings::create_new());
        session.set_master_volume(0.5);
        session.set_max_master_volume(4.0);
        assert_eq!(session.master_volume(), 0.5);
        assert_eq!(session.control().master_volume(), 2.0);

        session.set_master_volume(3.0);
        assert_eq!(session.master_volume(), 1.0);
    }

    #[test]
    fn test_mute_toggles_enabled_flag() {
        let mut session = session(SessionSettings::create_new());
        assert!(session.control().flag(Flag::Enabled));
        session.set_muted(true);
        assert!(!session.control().flag(Flag::Enabled));
        assert!(session.control().flag(Flag::Initialized));
    }

    #[test]
    fn test_monitor_volume_tracks_recent_peaks() {
        let mut session = session(SessionSettings::create_new());
        session.apply_snapshot(&snapshot(1, 0.4, 1.0));
        session.apply_snapshot(&snapshot(2, 0.2, 1.0));
        assert!((session.monitor_volume() - 0.4).abs() < 1e-6);

        // same tick again is not a new frame
        session.apply_snapshot(&snapshot(2, 0.9, 1.0));
        assert!((session.monitor_volume() - 0.4).abs() < 1e-6);

        for tick in 3..9 {
            session.apply_snapshot(&snapshot(tick, 0.1, 1.0));
        }
        assert!((session.monitor_volume() - 0.1).abs() < 1e-6);

        session.set_master_volume(0.05);
        assert!((session.monitor_volume() - 0.05).abs() < 1e-6);

        session.set_muted(true);
        assert_eq!(session.monitor_volume(), 0.0);
    }

    #[test]
    fn test_snapshot_updates_format_and_channels() {
        let mut session = session(SessionSettings::create_new());
        assert_eq!(session.channels().count(), 0);
        session.apply_snapshot(&snapshot(1, 0.0, 1.0));
        assert_eq!(session.sample_rate(), 48000);
        assert_eq!(
            session.channels().collect::<Vec<_>>(),
            vec![Channel::FRONT_LEFT, Channel::FRONT_RIGHT]
        );
        assert!(session.has_channel(Channel::FRONT_RIGHT));
        assert!(!session.has_channel(Channel::FRONT_CENTER));
    }

    #[test]
    fn test_cursor_delta_wraps() {
        let mut session = session(SessionSettings::create_new());
        let mut writer = session.control().tap_writer();

        session.update_cursor();
        assert_eq!(session.tap_write_cursor_delta(), 0);

        writer.write(&[0u8; 50]);
        session.update_cursor();
        assert_eq!(session.tap_write_cursor_delta(), 50);

        writer.write(&[0u8; 30]);
        session.update_cursor();
        assert_eq!(session.tap_write_cursor_delta(), 30);

        session.update_cursor();
        assert_eq!(session.tap_write_cursor_delta(), 0);
    }
}
