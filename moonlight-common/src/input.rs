//! Input packet assembly.
//!
//! Every event becomes `size (BE u32) || magic (LE u32) || body`, with the
//! magic selecting the event kind and the host generation selecting magic
//! variants. Movement events coalesce while a send is in flight, legacy
//! hosts get scroll batching in 120-unit wheel notches, and controller
//! states deduplicate against the last sent state per controller number.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{MoonlightError, Result};
use crate::protocol;
use crate::types::{version_at_least, MotionType};

/// Gamepad slots: GFE drives 4, Sunshine 16.
pub const MAX_GAMEPADS_LEGACY: usize = 4;
pub const MAX_GAMEPADS_SUNSHINE: usize = 16;
const MAX_MOTION_EVENTS: usize = 2;

/// One assembled packet bound for the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputWirePacket {
    pub channel_id: u8,
    pub flags: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct GamepadState {
    button_flags: u32,
    left_trigger: u8,
    right_trigger: u8,
    left_stick_x: i16,
    left_stick_y: i16,
    right_stick_x: i16,
    right_stick_y: i16,
}

#[derive(Default)]
struct RelMouseState {
    delta_x: i32,
    delta_y: i32,
    pending: bool,
}

#[derive(Default)]
struct AbsMouseState {
    x: i16,
    y: i16,
    width: i16,
    height: i16,
    pending: bool,
    dirty: bool,
}

#[derive(Default, Clone, Copy)]
struct SensorState {
    x: f32,
    y: f32,
    z: f32,
    pending: bool,
    dirty: bool,
}

struct InputState {
    initialized: bool,
    rel_mouse: RelMouseState,
    abs_mouse: AbsMouseState,
    batched_scroll_delta: i32,
    pen_button_state: u8,
    last_gamepad: [Option<GamepadState>; MAX_GAMEPADS_SUNSHINE],
    sensors: [[SensorState; MAX_MOTION_EVENTS]; MAX_GAMEPADS_SUNSHINE],
}

pub struct InputStream {
    gen5: bool,
    is_sunshine: bool,
    /// GFE >= 7.1.409 wants scroll collapsed into whole wheel notches.
    batch_scroll: bool,
    state: Mutex<InputState>,
    tx: mpsc::UnboundedSender<InputWirePacket>,
}

impl InputStream {
    pub fn new(
        app_version: [u32; 4],
        is_sunshine: bool,
        tx: mpsc::UnboundedSender<InputWirePacket>,
    ) -> Self {
        Self {
            gen5: app_version[0] >= 5,
            is_sunshine,
            batch_scroll: version_at_least(app_version, 7, 1, 409) && !is_sunshine,
            state: Mutex::new(InputState {
                initialized: true,
                rel_mouse: RelMouseState::default(),
                abs_mouse: AbsMouseState::default(),
                batched_scroll_delta: 0,
                pen_button_state: 0,
                last_gamepad: [None; MAX_GAMEPADS_SUNSHINE],
                sensors: [[SensorState::default(); MAX_MOTION_EVENTS]; MAX_GAMEPADS_SUNSHINE],
            }),
            tx,
        }
    }

    pub fn max_gamepads(&self) -> usize {
        if self.is_sunshine {
            MAX_GAMEPADS_SUNSHINE
        } else {
            MAX_GAMEPADS_LEGACY
        }
    }

    pub fn close(&self) {
        self.state.lock().expect("input state lock").initialized = false;
    }

    /// A previously emitted packet finished its trip to the host; flush any
    /// movement or sensor state that accumulated in the meantime.
    pub fn on_send_complete(&self) {
        let mut state = self.state.lock().expect("input state lock");
        if !state.initialized {
            return;
        }

        if state.rel_mouse.pending {
            if state.rel_mouse.delta_x != 0 || state.rel_mouse.delta_y != 0 {
                let dx = clamp_i16(state.rel_mouse.delta_x);
                let dy = clamp_i16(state.rel_mouse.delta_y);
                state.rel_mouse.delta_x = 0;
                state.rel_mouse.delta_y = 0;
                self.emit(protocol::CTRL_CHANNEL_MOUSE, protocol::PACKET_FLAG_RELIABLE,
                    self.build_rel_mouse(dx, dy));
            } else {
                state.rel_mouse.pending = false;
            }
        }

        if state.abs_mouse.pending {
            if state.abs_mouse.dirty {
                state.abs_mouse.dirty = false;
                let (x, y, w, h) = (
                    state.abs_mouse.x,
                    state.abs_mouse.y,
                    state.abs_mouse.width,
                    state.abs_mouse.height,
                );
                self.emit(protocol::CTRL_CHANNEL_MOUSE, protocol::PACKET_FLAG_RELIABLE,
                    self.build_abs_mouse(x, y, w, h));
            } else {
                state.abs_mouse.pending = false;
            }
        }

        for number in 0..MAX_GAMEPADS_SUNSHINE {
            for motion in 0..MAX_MOTION_EVENTS {
                let sensor = &mut state.sensors[number][motion];
                if sensor.pending {
                    if sensor.dirty {
                        sensor.dirty = false;
                        let (x, y, z) = (sensor.x, sensor.y, sensor.z);
                        self.emit(
                            protocol::CTRL_CHANNEL_SENSOR_BASE + number as u8,
                            protocol::PACKET_FLAG_RELIABLE,
                            self.build_motion(number as u8, motion as u8 + 1, x, y, z),
                        );
                    } else {
                        sensor.pending = false;
                    }
                }
            }
        }
    }

    /// Relative mouse movement, coalesced while a move is on the wire.
    pub fn send_mouse_move(&self, delta_x: i16, delta_y: i16) -> Result<()> {
        if delta_x == 0 && delta_y == 0 {
            return Ok(());
        }
        let mut state = self.lock_initialized()?;
        state.rel_mouse.delta_x += i32::from(delta_x);
        state.rel_mouse.delta_y += i32::from(delta_y);
        if !state.rel_mouse.pending {
            state.rel_mouse.pending = true;
            let dx = clamp_i16(state.rel_mouse.delta_x);
            let dy = clamp_i16(state.rel_mouse.delta_y);
            state.rel_mouse.delta_x = 0;
            state.rel_mouse.delta_y = 0;
            self.emit(
                protocol::CTRL_CHANNEL_MOUSE,
                protocol::PACKET_FLAG_RELIABLE,
                self.build_rel_mouse(dx, dy),
            );
        }
        Ok(())
    }

    /// Absolute mouse position against a reference surface.
    pub fn send_mouse_position(
        &self,
        x: i16,
        y: i16,
        ref_width: i16,
        ref_height: i16,
    ) -> Result<()> {
        let mut state = self.lock_initialized()?;
        state.abs_mouse.x = x;
        state.abs_mouse.y = y;
        state.abs_mouse.width = ref_width;
        state.abs_mouse.height = ref_height;
        if !state.abs_mouse.pending {
            state.abs_mouse.pending = true;
            self.emit(
                protocol::CTRL_CHANNEL_MOUSE,
                protocol::PACKET_FLAG_RELIABLE,
                self.build_abs_mouse(x, y, ref_width, ref_height),
            );
        } else {
            state.abs_mouse.dirty = true;
        }
        Ok(())
    }

    pub fn send_mouse_button(&self, action: u8, button: u8) -> Result<()> {
        let _state = self.lock_initialized()?;
        let mut magic = u32::from(action);
        if self.gen5 {
            magic += 1;
        }
        let mut data = packet_header(5, magic);
        data.push(button);
        self.emit(
            protocol::CTRL_CHANNEL_MOUSE,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    pub fn send_keyboard(
        &self,
        key_code: i16,
        action: u8,
        modifiers: u8,
        flags: u8,
    ) -> Result<()> {
        let _state = self.lock_initialized()?;
        let (key_code, modifiers) = if self.is_sunshine {
            (key_code, modifiers)
        } else {
            fix_modifiers(key_code, modifiers)
        };

        let mut data = packet_header(10, u32::from(action));
        data.push(if self.is_sunshine { flags } else { 0 });
        data.extend_from_slice(&(key_code as u16).to_le_bytes());
        data.push(modifiers);
        data.extend_from_slice(&[0, 0]);
        self.emit(
            protocol::CTRL_CHANNEL_KEYBOARD,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    /// Vertical scroll. Legacy GFE accumulates into whole wheel notches and
    /// discards the remainder on direction change.
    pub fn send_scroll(&self, amount: i16) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut state = self.lock_initialized()?;

        if !self.batch_scroll {
            drop(state);
            self.emit(
                protocol::CTRL_CHANNEL_MOUSE,
                protocol::PACKET_FLAG_RELIABLE,
                self.build_scroll(amount),
            );
            return Ok(());
        }

        // Direction reversal throws away the partial notch.
        if (state.batched_scroll_delta < 0 && amount > 0)
            || (state.batched_scroll_delta > 0 && amount < 0)
        {
            state.batched_scroll_delta = 0;
        }
        state.batched_scroll_delta += i32::from(amount);

        while state.batched_scroll_delta.abs() >= protocol::WHEEL_DELTA {
            let notch = if state.batched_scroll_delta < 0 {
                -protocol::WHEEL_DELTA
            } else {
                protocol::WHEEL_DELTA
            };
            self.emit(
                protocol::CTRL_CHANNEL_MOUSE,
                protocol::PACKET_FLAG_RELIABLE,
                self.build_scroll(notch as i16),
            );
            state.batched_scroll_delta -= notch;
        }
        Ok(())
    }

    pub fn send_high_res_scroll(&self, amount: i16) -> Result<()> {
        self.send_scroll(amount)
    }

    /// Horizontal scroll, a Sunshine extension.
    pub fn send_hscroll(&self, amount: i16) -> Result<()> {
        let _state = self.lock_initialized()?;
        if !self.is_sunshine {
            return Err(MoonlightError::Unsupported);
        }
        if amount == 0 {
            return Ok(());
        }
        let mut data = packet_header(6, protocol::SS_HSCROLL_MAGIC);
        data.extend_from_slice(&amount.to_be_bytes());
        self.emit(
            protocol::CTRL_CHANNEL_MOUSE,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    /// Single-gamepad convenience wrapper over the multi-controller event.
    #[allow(clippy::too_many_arguments)]
    pub fn send_controller(
        &self,
        button_flags: i32,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<()> {
        self.send_multi_controller(
            0,
            1,
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_multi_controller(
        &self,
        controller_number: i16,
        active_gamepad_mask: i16,
        button_flags: i32,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<()> {
        let mut state = self.lock_initialized()?;

        // Old clients hand over sign-extended 16-bit button masks.
        let mut button_flags = button_flags;
        if button_flags < 0 {
            button_flags &= 0xFFFF;
        }
        let mut button_flags = button_flags as u32;

        let mut controller_number = controller_number;
        let mut active_gamepad_mask = active_gamepad_mask;
        if self.is_sunshine {
            controller_number %= MAX_GAMEPADS_SUNSHINE as i16;
        } else {
            controller_number %= MAX_GAMEPADS_LEGACY as i16;
            active_gamepad_mask &= 0xF;
            // GFE has no MISC button; route it to HOME.
            if button_flags & protocol::BUTTON_MISC != 0 {
                button_flags |= protocol::BUTTON_HOME;
            }
        }

        let gamepad = GamepadState {
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        };
        let slot = controller_number as usize;
        if state.last_gamepad[slot] == Some(gamepad) {
            return Ok(());
        }
        state.last_gamepad[slot] = Some(gamepad);

        let data = self.build_multi_controller(controller_number, active_gamepad_mask, &gamepad);
        self.emit(
            protocol::CTRL_CHANNEL_GAMEPAD_BASE + controller_number as u8,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    /// Announce a controller with its capabilities (Sunshine), then send the
    /// compatibility multi-controller event either way.
    pub fn send_controller_arrival(
        &self,
        controller_number: u8,
        active_gamepad_mask: u16,
        controller_type: u8,
        supported_buttons: u32,
        capabilities: u16,
    ) -> Result<()> {
        let controller_number = controller_number % MAX_GAMEPADS_SUNSHINE as u8;
        if self.is_sunshine {
            let _state = self.lock_initialized()?;
            let mut data = packet_header(12, protocol::SS_CONTROLLER_ARRIVAL_MAGIC);
            data.push(controller_number);
            data.push(controller_type);
            data.extend_from_slice(&capabilities.to_le_bytes());
            data.extend_from_slice(&supported_buttons.to_le_bytes());
            self.emit(
                protocol::CTRL_CHANNEL_GAMEPAD_BASE + controller_number,
                protocol::PACKET_FLAG_RELIABLE,
                data,
            );
        }
        self.send_multi_controller(
            i16::from(controller_number),
            active_gamepad_mask as i16,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
        )
    }

    /// Touch event (Sunshine). Hover and move frames may be dropped in
    /// transit, so they go unsequenced.
    #[allow(clippy::too_many_arguments)]
    pub fn send_touch(
        &self,
        event_type: u8,
        pointer_id: u32,
        x: f32,
        y: f32,
        pressure_or_distance: f32,
        contact_area_major: f32,
        contact_area_minor: f32,
        rotation: u16,
    ) -> Result<()> {
        let _state = self.lock_initialized()?;
        if !self.is_sunshine {
            return Err(MoonlightError::Unsupported);
        }

        let mut data = packet_header(36, protocol::SS_TOUCH_MAGIC);
        data.push(event_type);
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&pointer_id.to_le_bytes());
        data.extend_from_slice(&protocol::float_to_netfloat(x));
        data.extend_from_slice(&protocol::float_to_netfloat(y));
        data.extend_from_slice(&protocol::float_to_netfloat(pressure_or_distance));
        data.extend_from_slice(&protocol::float_to_netfloat(contact_area_major));
        data.extend_from_slice(&protocol::float_to_netfloat(contact_area_minor));
        data.extend_from_slice(&rotation.to_le_bytes());
        data.extend_from_slice(&[0, 0]);

        let flags = if matches!(
            event_type,
            protocol::TOUCH_EVENT_HOVER | protocol::TOUCH_EVENT_MOVE
        ) {
            0
        } else {
            protocol::PACKET_FLAG_RELIABLE
        };
        self.emit(protocol::CTRL_CHANNEL_TOUCH, flags, data);
        Ok(())
    }

    /// Pen event (Sunshine).
    #[allow(clippy::too_many_arguments)]
    pub fn send_pen(
        &self,
        event_type: u8,
        tool_type: u8,
        pen_buttons: u8,
        x: f32,
        y: f32,
        pressure_or_distance: f32,
        contact_area_major: f32,
        contact_area_minor: f32,
        rotation: u16,
        tilt: u8,
    ) -> Result<()> {
        let mut state = self.lock_initialized()?;
        if !self.is_sunshine {
            return Err(MoonlightError::Unsupported);
        }

        let mut data = packet_header(40, protocol::SS_PEN_MAGIC);
        data.push(event_type);
        data.push(tool_type);
        data.push(pen_buttons);
        data.push(0);
        data.extend_from_slice(&protocol::float_to_netfloat(x));
        data.extend_from_slice(&protocol::float_to_netfloat(y));
        data.extend_from_slice(&protocol::float_to_netfloat(pressure_or_distance));
        data.extend_from_slice(&rotation.to_le_bytes());
        data.push(tilt);
        data.push(0);
        data.extend_from_slice(&protocol::float_to_netfloat(contact_area_major));
        data.extend_from_slice(&protocol::float_to_netfloat(contact_area_minor));
        data.extend_from_slice(&[0u8; 8]);

        let hoverish = matches!(
            event_type,
            protocol::TOUCH_EVENT_HOVER | protocol::TOUCH_EVENT_MOVE
        );
        let flags = if hoverish && pen_buttons == state.pen_button_state {
            0
        } else {
            protocol::PACKET_FLAG_RELIABLE
        };
        state.pen_button_state = pen_buttons;
        self.emit(protocol::CTRL_CHANNEL_PEN, flags, data);
        Ok(())
    }

    /// Motion sensor sample (Sunshine), coalesced per controller and sensor.
    pub fn send_controller_motion(
        &self,
        controller_number: u8,
        motion: MotionType,
        x: f32,
        y: f32,
        z: f32,
    ) -> Result<()> {
        let mut state = self.lock_initialized()?;
        if !self.is_sunshine {
            return Err(MoonlightError::Unsupported);
        }

        let controller_number = controller_number % MAX_GAMEPADS_SUNSHINE as u8;
        let motion_index = motion as usize - 1;
        let sensor = &mut state.sensors[controller_number as usize][motion_index];
        sensor.x = x;
        sensor.y = y;
        sensor.z = z;
        if sensor.pending {
            sensor.dirty = true;
            return Ok(());
        }
        sensor.pending = true;
        self.emit(
            protocol::CTRL_CHANNEL_SENSOR_BASE + controller_number,
            protocol::PACKET_FLAG_RELIABLE,
            self.build_motion(controller_number, motion as u8, x, y, z),
        );
        Ok(())
    }

    /// Battery report (Sunshine).
    pub fn send_controller_battery(
        &self,
        controller_number: u8,
        battery_state: u8,
        percentage: u8,
    ) -> Result<()> {
        let _state = self.lock_initialized()?;
        if !self.is_sunshine {
            return Err(MoonlightError::Unsupported);
        }
        let controller_number = controller_number % MAX_GAMEPADS_SUNSHINE as u8;
        let mut data = packet_header(8, protocol::SS_CONTROLLER_BATTERY_MAGIC);
        data.push(controller_number);
        data.push(battery_state);
        data.push(percentage);
        data.push(0);
        self.emit(
            protocol::CTRL_CHANNEL_GAMEPAD_BASE + controller_number,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    pub fn send_utf8_text(&self, text: &str) -> Result<()> {
        let _state = self.lock_initialized()?;
        let bytes = text.as_bytes();
        let mut data = packet_header(4 + bytes.len() as u32, protocol::UTF8_TEXT_EVENT_MAGIC);
        data.extend_from_slice(bytes);
        self.emit(
            protocol::CTRL_CHANNEL_UTF8,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    pub fn send_haptics_enable(&self, enable: bool) -> Result<()> {
        let _state = self.lock_initialized()?;
        let mut data = packet_header(6, protocol::ENABLE_HAPTICS_MAGIC);
        data.extend_from_slice(&u16::from(enable).to_le_bytes());
        self.emit(
            protocol::CTRL_CHANNEL_GENERIC,
            protocol::PACKET_FLAG_RELIABLE,
            data,
        );
        Ok(())
    }

    fn lock_initialized(&self) -> Result<std::sync::MutexGuard<'_, InputState>> {
        let state = self.state.lock().expect("input state lock");
        if !state.initialized {
            return Err(MoonlightError::InputNotInitialized);
        }
        Ok(state)
    }

    fn emit(&self, channel_id: u8, flags: u32, data: Vec<u8>) {
        let _ = self.tx.send(InputWirePacket {
            channel_id,
            flags,
            data,
        });
    }

    fn build_rel_mouse(&self, delta_x: i16, delta_y: i16) -> Vec<u8> {
        let magic = if self.gen5 {
            protocol::MOUSE_MOVE_REL_MAGIC_GEN5
        } else {
            protocol::MOUSE_MOVE_REL_MAGIC
        };
        let mut data = packet_header(8, magic);
        data.extend_from_slice(&delta_x.to_be_bytes());
        data.extend_from_slice(&delta_y.to_be_bytes());
        data
    }

    fn build_abs_mouse(&self, x: i16, y: i16, width: i16, height: i16) -> Vec<u8> {
        let mut data = packet_header(14, protocol::MOUSE_MOVE_ABS_MAGIC);
        data.extend_from_slice(&(x as u16).to_be_bytes());
        data.extend_from_slice(&(y as u16).to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&(width.wrapping_sub(1) as u16).to_be_bytes());
        data.extend_from_slice(&(height.wrapping_sub(1) as u16).to_be_bytes());
        data
    }

    fn build_scroll(&self, amount: i16) -> Vec<u8> {
        let magic = if self.gen5 {
            protocol::SCROLL_MAGIC_GEN5
        } else {
            protocol::SCROLL_MAGIC
        };
        let mut data = packet_header(10, magic);
        data.extend_from_slice(&amount.to_be_bytes());
        data.extend_from_slice(&amount.to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        data
    }

    fn build_multi_controller(
        &self,
        controller_number: i16,
        active_gamepad_mask: i16,
        gamepad: &GamepadState,
    ) -> Vec<u8> {
        let magic = if self.gen5 {
            protocol::MULTI_CONTROLLER_MAGIC_GEN5
        } else {
            protocol::MULTI_CONTROLLER_MAGIC
        };
        let size = if self.is_sunshine { 30 } else { 26 };

        let mut data = packet_header(size, magic);
        data.extend_from_slice(&protocol::MULTI_CONTROLLER_HEADER_B.to_le_bytes());
        data.extend_from_slice(&(controller_number as u16).to_le_bytes());
        data.extend_from_slice(&(active_gamepad_mask as u16).to_le_bytes());
        data.extend_from_slice(&protocol::MULTI_CONTROLLER_MID_B.to_le_bytes());
        data.extend_from_slice(&((gamepad.button_flags & 0xFFFF) as u16).to_le_bytes());
        data.push(gamepad.left_trigger);
        data.push(gamepad.right_trigger);
        data.extend_from_slice(&gamepad.left_stick_x.to_le_bytes());
        data.extend_from_slice(&gamepad.left_stick_y.to_le_bytes());
        data.extend_from_slice(&gamepad.right_stick_x.to_le_bytes());
        data.extend_from_slice(&gamepad.right_stick_y.to_le_bytes());
        data.extend_from_slice(&protocol::MULTI_CONTROLLER_TAIL_A.to_le_bytes());
        if self.is_sunshine {
            data.extend_from_slice(&((gamepad.button_flags >> 16) as u16).to_le_bytes());
            data.extend_from_slice(&protocol::MULTI_CONTROLLER_TAIL_B.to_le_bytes());
        }
        data
    }

    fn build_motion(&self, controller_number: u8, motion_type: u8, x: f32, y: f32, z: f32) -> Vec<u8> {
        let mut data = packet_header(20, protocol::SS_CONTROLLER_MOTION_MAGIC);
        data.push(controller_number);
        data.push(motion_type);
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&protocol::float_to_netfloat(x));
        data.extend_from_slice(&protocol::float_to_netfloat(y));
        data.extend_from_slice(&protocol::float_to_netfloat(z));
        data
    }
}

/// `size (BE) || magic (LE)` prefix shared by all input packets.
fn packet_header(size: u32, magic: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + size as usize);
    data.extend_from_slice(&size.to_be_bytes());
    data.extend_from_slice(&magic.to_le_bytes());
    data
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Synthesize GFE-compatible modifier state from raw VK codes: the Win keys
/// clear Meta, and left/right Shift, Ctrl and Alt set or clear their bit.
fn fix_modifiers(key_code: i16, modifiers: u8) -> (i16, u8) {
    let mut modifiers = modifiers;
    match key_code & 0xFF {
        0x5B | 0x5C => modifiers &= !protocol::MODIFIER_META,
        0xA0 => modifiers |= protocol::MODIFIER_SHIFT,
        0xA1 => modifiers &= !protocol::MODIFIER_SHIFT,
        0xA2 => modifiers |= protocol::MODIFIER_CTRL,
        0xA3 => modifiers &= !protocol::MODIFIER_CTRL,
        0xA4 => modifiers |= protocol::MODIFIER_ALT,
        0xA5 => modifiers &= !protocol::MODIFIER_ALT,
        _ => {}
    }
    (key_code, modifiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUNSHINE_VERSION: [u32; 4] = [7, 1, 431, 0];
    const LEGACY_BATCHING_VERSION: [u32; 4] = [7, 1, 409, 0];
    const OLD_GFE_VERSION: [u32; 4] = [3, 20, 0, 0];

    fn stream(
        version: [u32; 4],
        sunshine: bool,
    ) -> (InputStream, mpsc::UnboundedReceiver<InputWirePacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InputStream::new(version, sunshine, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<InputWirePacket>) -> Vec<InputWirePacket> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn scroll_batches_to_wheel_notches() {
        let (stream, mut rx) = stream(LEGACY_BATCHING_VERSION, false);
        for _ in 0..4 {
            stream.send_scroll(30).unwrap();
        }
        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 1);
        // Body: size(4) magic(4) amount(BE) amount(BE) zero(2).
        let data = &packets[0].data;
        assert_eq!(&data[0..4], &10u32.to_be_bytes());
        assert_eq!(i16::from_be_bytes([data[8], data[9]]), 120);
        assert_eq!(i16::from_be_bytes([data[10], data[11]]), 120);
    }

    #[test]
    fn scroll_direction_reversal_discards_accumulator() {
        let (stream, mut rx) = stream(LEGACY_BATCHING_VERSION, false);
        stream.send_scroll(60).unwrap();
        stream.send_scroll(-60).unwrap();
        stream.send_scroll(60).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn sunshine_scroll_is_unbatched() {
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream.send_scroll(30).unwrap();
        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 1);
        assert_eq!(
            i16::from_be_bytes([packets[0].data[8], packets[0].data[9]]),
            30
        );
    }

    #[test]
    fn modifier_fixups_apply_on_legacy_hosts_only() {
        assert_eq!(fix_modifiers(0xA0, 0), (0xA0, protocol::MODIFIER_SHIFT));
        assert_eq!(fix_modifiers(0xA1, protocol::MODIFIER_SHIFT), (0xA1, 0));
        assert_eq!(fix_modifiers(0x5B, protocol::MODIFIER_META), (0x5B, 0));
        assert_eq!(fix_modifiers(0xA4, 0), (0xA4, protocol::MODIFIER_ALT));

        // Sunshine path leaves modifiers untouched and carries the flags byte.
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream.send_keyboard(0xA1, protocol::KEY_ACTION_DOWN, 0xFF, 0x01).unwrap();
        let packets = drain(&mut rx);
        assert_eq!(packets[0].data[8], 0x01);
        assert_eq!(packets[0].data[11], 0xFF);
    }

    #[test]
    fn keyboard_packet_layout() {
        let (stream, mut rx) = stream(OLD_GFE_VERSION, false);
        stream.send_keyboard(0x41, protocol::KEY_ACTION_DOWN, 0x02, 0x07).unwrap();
        let packet = drain(&mut rx).remove(0);
        assert_eq!(packet.channel_id, protocol::CTRL_CHANNEL_KEYBOARD);
        let data = packet.data;
        assert_eq!(&data[0..4], &10u32.to_be_bytes());
        assert_eq!(&data[4..8], &(protocol::KEYBOARD_MAGIC_DOWN).to_le_bytes());
        assert_eq!(data[8], 0); // flags byte zeroed on GFE
        assert_eq!(u16::from_le_bytes([data[9], data[10]]), 0x41);
        assert_eq!(data[11], 0x02);
        assert_eq!(&data[12..14], &[0, 0]);
    }

    #[test]
    fn multi_controller_layout_legacy_and_sunshine() {
        let (legacy, mut legacy_rx) = stream(LEGACY_BATCHING_VERSION, false);
        legacy
            .send_multi_controller(1, 0xF, 0x1000, 10, 20, 1, 2, 3, 4)
            .unwrap();
        let data = drain(&mut legacy_rx).remove(0).data;
        assert_eq!(&data[0..4], &26u32.to_be_bytes());
        assert_eq!(&data[4..8], &protocol::MULTI_CONTROLLER_MAGIC_GEN5.to_le_bytes());
        assert_eq!(u16::from_le_bytes([data[8], data[9]]), 0x001C);
        assert_eq!(u16::from_le_bytes([data[10], data[11]]), 1);
        assert_eq!(u16::from_le_bytes([data[16], data[17]]), 0x1000);
        assert_eq!(data.len(), 34);

        let (sunshine, mut sunshine_rx) = stream(SUNSHINE_VERSION, true);
        sunshine
            .send_multi_controller(1, 0xF, 0x0102_0304, 10, 20, 1, 2, 3, 4)
            .unwrap();
        let data = drain(&mut sunshine_rx).remove(0).data;
        assert_eq!(&data[0..4], &30u32.to_be_bytes());
        // Extended button flags carry the high 16 bits.
        assert_eq!(u16::from_le_bytes([data[16], data[17]]), 0x0304);
        assert_eq!(u16::from_le_bytes([data[30], data[31]]), 0x0102);
        assert_eq!(data.len(), 38);
    }

    #[test]
    fn controller_slot_mapping_wraps_by_host_generation() {
        let (legacy, mut legacy_rx) = stream(LEGACY_BATCHING_VERSION, false);
        legacy
            .send_multi_controller(5, 1, 0, 0, 0, 0, 0, 0, 0)
            .unwrap();
        let packet = drain(&mut legacy_rx).remove(0);
        // 5 % 4 == 1
        assert_eq!(packet.channel_id, protocol::CTRL_CHANNEL_GAMEPAD_BASE + 1);

        let (sunshine, mut sunshine_rx) = stream(SUNSHINE_VERSION, true);
        sunshine
            .send_multi_controller(5, 1, 0, 0, 0, 0, 0, 0, 0)
            .unwrap();
        let packet = drain(&mut sunshine_rx).remove(0);
        assert_eq!(packet.channel_id, protocol::CTRL_CHANNEL_GAMEPAD_BASE + 5);
    }

    #[test]
    fn negative_button_flags_mask_to_sixteen_bits() {
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream
            .send_multi_controller(0, 1, -1, 0, 0, 0, 0, 0, 0)
            .unwrap();
        let data = drain(&mut rx).remove(0).data;
        assert_eq!(u16::from_le_bytes([data[16], data[17]]), 0xFFFF);
        assert_eq!(u16::from_le_bytes([data[30], data[31]]), 0);
    }

    #[test]
    fn duplicate_controller_state_is_suppressed() {
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream
            .send_multi_controller(0, 1, 0x1000, 0, 0, 0, 0, 0, 0)
            .unwrap();
        stream
            .send_multi_controller(0, 1, 0x1000, 0, 0, 0, 0, 0, 0)
            .unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        stream
            .send_multi_controller(0, 1, 0x2000, 0, 0, 0, 0, 0, 0)
            .unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn mouse_moves_coalesce_while_in_flight() {
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream.send_mouse_move(1, 1).unwrap();
        stream.send_mouse_move(2, 2).unwrap();
        stream.send_mouse_move(3, 3).unwrap();

        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(i16::from_be_bytes([data[8], data[9]]), 1);

        stream.on_send_complete();
        let packets = drain(&mut rx);
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(i16::from_be_bytes([data[8], data[9]]), 5);
        assert_eq!(i16::from_be_bytes([data[10], data[11]]), 5);

        stream.on_send_complete();
        stream.on_send_complete();
        assert!(drain(&mut rx).is_empty());

        // Gate released: the next move emits immediately again.
        stream.send_mouse_move(7, 0).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn touch_requires_sunshine_and_places_netfloats() {
        let (legacy, _legacy_rx) = stream(OLD_GFE_VERSION, false);
        assert!(matches!(
            legacy.send_touch(protocol::TOUCH_EVENT_DOWN, 1, 0.5, 0.5, 1.0, 0.0, 0.0, 0),
            Err(MoonlightError::Unsupported)
        ));

        let (sunshine, mut rx) = stream(SUNSHINE_VERSION, true);
        sunshine
            .send_touch(protocol::TOUCH_EVENT_DOWN, 9, 0.25, 0.75, 1.0, 0.0, 0.0, 90)
            .unwrap();
        let packet = drain(&mut rx).remove(0);
        assert_eq!(packet.channel_id, protocol::CTRL_CHANNEL_TOUCH);
        assert_eq!(packet.flags, protocol::PACKET_FLAG_RELIABLE);
        let data = &packet.data;
        assert_eq!(&data[0..4], &36u32.to_be_bytes());
        assert_eq!(u32::from_le_bytes([data[12], data[13], data[14], data[15]]), 9);
        assert_eq!(
            protocol::netfloat_to_float([data[16], data[17], data[18], data[19]]),
            0.25
        );

        // Hover frames ride unsequenced.
        sunshine
            .send_touch(protocol::TOUCH_EVENT_HOVER, 9, 0.25, 0.75, 0.0, 0.0, 0.0, 0)
            .unwrap();
        assert_eq!(drain(&mut rx).remove(0).flags, 0);
    }

    #[test]
    fn utf8_text_packet_wraps_raw_bytes() {
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream.send_utf8_text("héllo").unwrap();
        let data = drain(&mut rx).remove(0).data;
        let text_len = "héllo".len() as u32;
        assert_eq!(&data[0..4], &(4 + text_len).to_be_bytes());
        assert_eq!(&data[4..8], &protocol::UTF8_TEXT_EVENT_MAGIC.to_le_bytes());
        assert_eq!(&data[8..], "héllo".as_bytes());
    }

    #[test]
    fn closed_stream_refuses_events() {
        let (stream, mut rx) = stream(SUNSHINE_VERSION, true);
        stream.close();
        assert!(matches!(
            stream.send_mouse_move(1, 1),
            Err(MoonlightError::InputNotInitialized)
        ));
        assert!(drain(&mut rx).is_empty());
    }
}
