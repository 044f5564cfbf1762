//! Input system for keyboard and mouse state
//!
//! Collects winit events into per-frame state (held keys, keys pressed this frame,
//! mouse delta) and drives the camera: left-drag mouse look and WASD planar movement.

use std::collections::HashSet;

use tracing::debug;
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use crate::component::Camera;
use crate::core::config::InputConfig;

/// InputSystem tracks keyboard and mouse state between frames
#[derive(Debug)]
pub struct InputSystem {
    // Keyboard state
    pressed_keys: HashSet<KeyCode>,
    triggered_keys: HashSet<KeyCode>,

    // Mouse state
    mouse_buttons: HashSet<MouseButton>,
    triggered_buttons: HashSet<MouseButton>,
    last_mouse_pos: Option<(f64, f64)>,
    mouse_delta: (f32, f32),

    config: InputConfig,
}

impl InputSystem {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            pressed_keys: HashSet::new(),
            triggered_keys: HashSet::new(),
            mouse_buttons: HashSet::new(),
            triggered_buttons: HashSet::new(),
            last_mouse_pos: None,
            mouse_delta: (0.0, 0.0),
            config: config.clone(),
        }
    }

    /// Feed a window event, returns true if it was an input event
    pub fn handle_window_event(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.on_keyboard_input(code, event.state);
                }
                true
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.on_mouse_button(*button, *state);
                true
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.on_mouse_move((position.x, position.y));
                true
            }
            WindowEvent::Focused(false) => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn on_keyboard_input(&mut self, keycode: KeyCode, state: ElementState) {
        match state {
            ElementState::Pressed => {
                // OS key repeat does not count as a new press
                if self.pressed_keys.insert(keycode) {
                    self.triggered_keys.insert(keycode);
                }
            }
            ElementState::Released => {
                self.pressed_keys.remove(&keycode);
            }
        }
    }

    pub fn on_mouse_button(&mut self, button: MouseButton, state: ElementState) {
        match state {
            ElementState::Pressed => {
                if self.mouse_buttons.insert(button) {
                    self.triggered_buttons.insert(button);
                }
            }
            ElementState::Released => {
                self.mouse_buttons.remove(&button);
            }
        }
    }

    /// Accumulates cursor movement until the end of the frame
    pub fn on_mouse_move(&mut self, position: (f64, f64)) {
        if let Some(last) = self.last_mouse_pos {
            self.mouse_delta.0 += (position.0 - last.0) as f32;
            self.mouse_delta.1 += (position.1 - last.1) as f32;
        }
        self.last_mouse_pos = Some(position);
    }

    /// Apply mouse look and WASD movement, then recompute the camera matrices
    ///
    /// Left drag: yaw += dx * sensitivity, pitch += dy * sensitivity (clamped).
    pub fn update_camera(&self, camera: &mut Camera, delta_time: f32) {
        if self.is_mouse_button_pressed(MouseButton::Left) {
            let sensitivity = self.config.mouse_sensitivity;
            camera.rotate(
                self.mouse_delta.0 * sensitivity,
                self.mouse_delta.1 * sensitivity,
                self.config.pitch_limit,
            );
        }

        let mut forward = 0.0;
        let mut right = 0.0;
        if self.is_key_pressed(KeyCode::KeyW) {
            forward += 1.0;
        }
        if self.is_key_pressed(KeyCode::KeyS) {
            forward -= 1.0;
        }
        if self.is_key_pressed(KeyCode::KeyD) {
            right += 1.0;
        }
        if self.is_key_pressed(KeyCode::KeyA) {
            right -= 1.0;
        }
        if forward != 0.0 || right != 0.0 {
            let sprint = self.is_key_pressed(KeyCode::ShiftLeft) || self.is_key_pressed(KeyCode::ShiftRight);
            let speed = if sprint { self.config.sprint_speed } else { self.config.move_speed };
            camera.move_planar(forward * speed * delta_time, right * speed * delta_time);
        }

        camera.update();
    }

    /// Clear per-frame state, call once after the frame is processed
    pub fn end_frame(&mut self) {
        self.triggered_keys.clear();
        self.triggered_buttons.clear();
        self.mouse_delta = (0.0, 0.0);
    }

    /// Drop all held state (window lost focus)
    pub fn reset(&mut self) {
        self.pressed_keys.clear();
        self.mouse_buttons.clear();
        self.end_frame();
        self.last_mouse_pos = None;
        debug!("Input state reset");
    }

    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.pressed_keys.contains(&key)
    }

    /// Pressed during this frame
    pub fn is_key_triggered(&self, key: KeyCode) -> bool {
        self.triggered_keys.contains(&key)
    }

    pub fn is_mouse_button_pressed(&self, button: MouseButton) -> bool {
        self.mouse_buttons.contains(&button)
    }

    pub fn is_mouse_button_triggered(&self, button: MouseButton) -> bool {
        self.triggered_buttons.contains(&button)
    }

    pub fn mouse_delta(&self) -> (f32, f32) {
        self.mouse_delta
    }

    pub fn config(&self) -> &InputConfig {
        &self.config
    }
}

impl Default for InputSystem {
    fn default() -> Self {
        Self::new(&InputConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_drag_rotates_camera() {
        let mut input = InputSystem::default();
        let mut camera = Camera::default();

        input.on_mouse_move((100.0, 100.0));
        input.on_mouse_button(MouseButton::Left, ElementState::Pressed);
        input.on_mouse_move((140.0, 110.0));
        input.update_camera(&mut camera, 0.016);

        assert!((camera.yaw() - 40.0 * 0.0025).abs() < 1e-6);
        assert!((camera.pitch() - 10.0 * 0.0025).abs() < 1e-6);
    }

    #[test]
    fn test_mouse_move_without_button_does_not_rotate() {
        let mut input = InputSystem::default();
        let mut camera = Camera::default();
        input.on_mouse_move((0.0, 0.0));
        input.on_mouse_move((500.0, 0.0));
        input.update_camera(&mut camera, 0.016);
        assert_eq!(camera.yaw(), 0.0);
    }

    #[test]
    fn test_pitch_clamped_by_config() {
        let mut input = InputSystem::default();
        let mut camera = Camera::default();
        input.on_mouse_move((0.0, 0.0));
        input.on_mouse_button(MouseButton::Left, ElementState::Pressed);
        input.on_mouse_move((0.0, 100_000.0));
        input.update_camera(&mut camera, 0.016);
        assert!((camera.pitch() - input.config().pitch_limit).abs() < 1e-6);
    }

    #[test]
    fn test_wasd_moves_with_sprint() {
        let mut input = InputSystem::default();
        let mut camera = Camera::default();
        let start = camera.position();

        input.on_keyboard_input(KeyCode::KeyW, ElementState::Pressed);
        input.update_camera(&mut camera, 1.0);
        assert!((camera.position().z - start.z - 2.5).abs() < 1e-5);

        input.on_keyboard_input(KeyCode::ShiftLeft, ElementState::Pressed);
        input.update_camera(&mut camera, 1.0);
        assert!((camera.position().z - start.z - 8.5).abs() < 1e-5);
    }

    #[test]
    fn test_trigger_lasts_one_frame() {
        let mut input = InputSystem::default();
        input.on_keyboard_input(KeyCode::Space, ElementState::Pressed);
        assert!(input.is_key_triggered(KeyCode::Space));

        input.end_frame();
        // 按键重复不算新的按下
        input.on_keyboard_input(KeyCode::Space, ElementState::Pressed);
        assert!(!input.is_key_triggered(KeyCode::Space));
        assert!(input.is_key_pressed(KeyCode::Space));
    }
}
