// SPDX-License-Identifier: CEPL-1.0
use bismuth_math::glam::Vec3;
use bismuth_math::Transform;
use bismuth_platform::winit::keyboard::KeyCode;
use bismuth_platform::KeyState;
use std::f32::consts::TAU;

const PITCH_LIMIT: f32 = 1.5;
const SLOW_MOVE_SPEED: f32 = 1.0;

#[derive(Clone, Copy, Debug)]
pub struct KeyMappings {
    pub move_left: KeyCode,
    pub move_right: KeyCode,
    pub move_forward: KeyCode,
    pub move_backward: KeyCode,
    pub move_up: KeyCode,
    pub move_down: KeyCode,
    pub look_left: KeyCode,
    pub look_right: KeyCode,
    pub look_up: KeyCode,
    pub look_down: KeyCode,
    pub slow_down: KeyCode,
}

impl Default for KeyMappings {
    fn default() -> Self {
        Self {
            move_left: KeyCode::KeyA,
            move_right: KeyCode::KeyD,
            move_forward: KeyCode::KeyW,
            move_backward: KeyCode::KeyS,
            move_up: KeyCode::Space,
            move_down: KeyCode::ControlLeft,
            look_left: KeyCode::ArrowLeft,
            look_right: KeyCode::ArrowRight,
            look_up: KeyCode::ArrowUp,
            look_down: KeyCode::ArrowDown,
            slow_down: KeyCode::ShiftLeft,
        }
    }
}

/// First-person fly camera driven by held keys. Movement stays level: only
/// yaw affects the direction of travel.
#[derive(Clone, Copy, Debug)]
pub struct KeyboardMovementController {
    pub keys: KeyMappings,
    pub move_speed: f32,
    /// Used instead of `move_speed` while `keys.slow_down` is held.
    pub slow_move_speed: f32,
    pub look_speed: f32,
}

impl KeyboardMovementController {
    pub fn new(move_speed: f32, look_speed: f32) -> Self {
        Self {
            keys: KeyMappings::default(),
            move_speed,
            slow_move_speed: SLOW_MOVE_SPEED,
            look_speed,
        }
    }

    pub fn move_in_plane_xz(&self, pressed: &KeyState, dt: f32, object: &mut Transform) {
        let axis = |pos: KeyCode, neg: KeyCode| {
            pressed.is_pressed(pos) as i32 as f32 - pressed.is_pressed(neg) as i32 as f32
        };

        let rotate = Vec3::new(
            axis(self.keys.look_up, self.keys.look_down),
            axis(self.keys.look_right, self.keys.look_left),
            0.0,
        );
        if rotate.length_squared() > f32::EPSILON {
            object.rotation += self.look_speed * dt * rotate.normalize();
        }
        object.rotation.x = object.rotation.x.clamp(-PITCH_LIMIT, PITCH_LIMIT);
        object.rotation.y = object.rotation.y.rem_euclid(TAU);

        let yaw = object.rotation.y;
        let forward = Vec3::new(yaw.sin(), 0.0, yaw.cos());
        let right = Vec3::new(forward.z, 0.0, -forward.x);
        // -Y is up in clip space.
        let up = Vec3::NEG_Y;

        let move_dir = forward * axis(self.keys.move_forward, self.keys.move_backward)
            + right * axis(self.keys.move_right, self.keys.move_left)
            + up * axis(self.keys.move_up, self.keys.move_down);
        if move_dir.length_squared() > f32::EPSILON {
            let speed = if pressed.is_pressed(self.keys.slow_down) {
                self.slow_move_speed
            } else {
                self.move_speed
            };
            object.translation += speed * dt * move_dir.normalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bismuth_platform::winit::event::ElementState;

    fn held(codes: &[KeyCode]) -> KeyState {
        let mut keys = KeyState::default();
        for &code in codes {
            keys.apply(code, ElementState::Pressed);
        }
        keys
    }

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn idle_keys_leave_the_transform_alone() {
        let ctl = KeyboardMovementController::new(3.0, 1.5);
        let mut t = Transform::default();
        ctl.move_in_plane_xz(&KeyState::default(), 0.5, &mut t);
        assert_eq!(t, Transform::default());
    }

    #[test]
    fn forward_follows_yaw() {
        let ctl = KeyboardMovementController::new(2.0, 1.5);
        let mut t = Transform::default();
        ctl.move_in_plane_xz(&held(&[KeyCode::KeyW]), 0.5, &mut t);
        assert!(close(t.translation, Vec3::new(0.0, 0.0, 1.0)));

        let mut t = Transform::default();
        t.rotation.y = std::f32::consts::FRAC_PI_2;
        ctl.move_in_plane_xz(&held(&[KeyCode::KeyW]), 0.5, &mut t);
        assert!(close(t.translation, Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn diagonal_movement_is_normalized() {
        let ctl = KeyboardMovementController::new(1.0, 1.5);
        let mut t = Transform::default();
        ctl.move_in_plane_xz(&held(&[KeyCode::KeyW, KeyCode::KeyD]), 1.0, &mut t);
        assert!((t.translation.length() - 1.0).abs() < 1e-5);
        assert_eq!(t.translation.y, 0.0);
    }

    #[test]
    fn space_moves_up_the_screen() {
        let ctl = KeyboardMovementController::new(1.0, 1.5);
        let mut t = Transform::default();
        ctl.move_in_plane_xz(&held(&[KeyCode::Space]), 1.0, &mut t);
        assert!(close(t.translation, Vec3::new(0.0, -1.0, 0.0)));
    }

    #[test]
    fn shift_slows_movement() {
        let ctl = KeyboardMovementController::new(3.0, 1.5);
        let mut t = Transform::default();
        ctl.move_in_plane_xz(&held(&[KeyCode::KeyS, KeyCode::ShiftLeft]), 1.0, &mut t);
        assert!(close(t.translation, Vec3::new(0.0, 0.0, -SLOW_MOVE_SPEED)));
    }

    #[test]
    fn opposing_keys_cancel() {
        let ctl = KeyboardMovementController::new(1.0, 1.5);
        let mut t = Transform::default();
        ctl.move_in_plane_xz(&held(&[KeyCode::KeyA, KeyCode::KeyD]), 1.0, &mut t);
        assert_eq!(t.translation, Vec3::ZERO);
    }

    #[test]
    fn pitch_is_clamped() {
        let ctl = KeyboardMovementController::new(1.0, 1.0);
        let mut t = Transform::default();
        t.rotation.x = 1.4;
        ctl.move_in_plane_xz(&held(&[KeyCode::ArrowUp]), 1.0, &mut t);
        assert_eq!(t.rotation.x, PITCH_LIMIT);
    }

    #[test]
    fn yaw_wraps_into_one_turn() {
        let ctl = KeyboardMovementController::new(1.0, 1.0);
        let mut t = Transform::default();
        t.rotation.y = 6.0;
        ctl.move_in_plane_xz(&held(&[KeyCode::ArrowRight]), 1.0, &mut t);
        assert!((t.rotation.y - (7.0 - TAU)).abs() < 1e-5);

        let mut t = Transform::default();
        ctl.move_in_plane_xz(&held(&[KeyCode::ArrowLeft]), 0.5, &mut t);
        assert!((t.rotation.y - (TAU - 0.5)).abs() < 1e-5);
    }
}
