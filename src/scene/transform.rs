use glam::{EulerRot, Mat4, Quat, Vec3};

/// Whether an operation is expressed in the object's own axes or in world axes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Orientation {
    Local,
    Global,
}

/// Whether an operation overwrites the current value or accumulates onto it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Mode {
    Replace,
    Append,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AngleUnit {
    Degrees,
    Radians,
}

impl AngleUnit {
    fn to_radians(self, angle: f32) -> f32 {
        match self {
            Self::Degrees => angle.to_radians(),
            Self::Radians => angle,
        }
    }
}

/// Scale, rotation and position of an object; applied in that order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub scale: Vec3,
    pub rotation: Quat,
    pub position: Vec3,
}

impl Transform {
    pub const IDENTITY: Self = Self {
        scale: Vec3::ONE,
        rotation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    /// Returns `T · R · S`.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Returns `S⁻¹ · Rᵀ · T⁻¹`; zero scale components invert to zero.
    pub fn inverse_matrix(&self) -> Mat4 {
        let inv_scale = Vec3::select(self.scale.cmpeq(Vec3::ZERO), Vec3::ZERO, self.scale.recip());

        Mat4::from_scale(inv_scale)
            * Mat4::from_quat(self.rotation.conjugate())
            * Mat4::from_translation(-self.position)
    }

    /// Returns the upper 3×4 of [`Transform::matrix`] in row-major order.
    pub fn to_instance_matrix(&self) -> [f32; 12] {
        let rows = self.matrix().transpose().to_cols_array();
        let mut res = [0.0; 12];
        res.copy_from_slice(&rows[0..12]);

        res
    }

    pub fn scale(&mut self, scale: Vec3, orientation: Orientation, mode: Mode) {
        let scale = match orientation {
            Orientation::Global => scale,
            Orientation::Local => {
                let rotated = self.rotation * scale;

                // The rotated vector keeps the sign of each input component
                Vec3::select(
                    (rotated * scale).cmplt(Vec3::ZERO),
                    -rotated,
                    rotated,
                )
            }
        };

        self.scale = match mode {
            Mode::Replace => scale,
            Mode::Append => self.scale + scale,
        };
    }

    /// Rotates by Euler angles in `(pitch, yaw, roll)` order; roll is applied first, then pitch,
    /// then yaw.
    pub fn rotate(&mut self, angles: Vec3, unit: AngleUnit, orientation: Orientation, mode: Mode) {
        let rotation = Quat::from_euler(
            EulerRot::YXZ,
            unit.to_radians(angles.y),
            unit.to_radians(angles.x),
            unit.to_radians(angles.z),
        );

        self.rotate_by(rotation, orientation, mode);
    }

    pub fn rotate_by(&mut self, rotation: Quat, orientation: Orientation, mode: Mode) {
        let current = match mode {
            Mode::Replace => Quat::IDENTITY,
            Mode::Append => self.rotation,
        };

        self.rotation = match orientation {
            Orientation::Global => rotation * current,
            Orientation::Local => current * rotation,
        }
        .normalize();
    }

    pub fn translate(&mut self, translation: Vec3, orientation: Orientation, mode: Mode) {
        let translation = match orientation {
            Orientation::Global => translation,
            Orientation::Local => self.rotation * translation,
        };

        self.position = match mode {
            Mode::Replace => translation,
            Mode::Append => self.position + translation,
        };
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::f32::consts::FRAC_PI_2};

    fn assert_vec3_eq(lhs: Vec3, rhs: Vec3) {
        assert!(lhs.abs_diff_eq(rhs, 1e-5), "{lhs} != {rhs}");
    }

    #[test]
    pub fn matrix_scales_then_rotates_then_translates() {
        let mut transform = Transform::IDENTITY;
        transform.scale(Vec3::new(2.0, 1.0, 1.0), Orientation::Global, Mode::Replace);
        transform.rotate(
            Vec3::new(0.0, 90.0, 0.0),
            AngleUnit::Degrees,
            Orientation::Global,
            Mode::Replace,
        );
        transform.translate(Vec3::new(0.0, 0.0, 5.0), Orientation::Global, Mode::Replace);

        // +X scaled to 2, yawed onto -Z, then moved along +Z
        let point = transform.matrix().transform_point3(Vec3::X);
        assert_vec3_eq(point, Vec3::new(0.0, 0.0, 3.0));
    }

    #[test]
    pub fn inverse_undoes_matrix() {
        let transform = Transform {
            scale: Vec3::new(2.0, 3.0, 0.5),
            rotation: Quat::from_rotation_z(0.3),
            position: Vec3::new(1.0, -2.0, 4.0),
        };
        let point = Vec3::new(0.25, 0.5, -1.0);
        let round_trip = transform
            .inverse_matrix()
            .transform_point3(transform.matrix().transform_point3(point));

        assert_vec3_eq(round_trip, point);
    }

    #[test]
    pub fn zero_scale_inverts_to_zero() {
        let transform = Transform {
            scale: Vec3::new(0.0, 1.0, 1.0),
            ..Transform::IDENTITY
        };

        let inverse = transform.inverse_matrix();
        assert!(inverse.is_finite());
        assert_eq!(inverse.x_axis.x, 0.0);
    }

    #[test]
    pub fn local_translation_follows_rotation() {
        let mut transform = Transform::IDENTITY;
        transform.rotate_by(
            Quat::from_rotation_z(FRAC_PI_2),
            Orientation::Global,
            Mode::Replace,
        );
        transform.translate(Vec3::X, Orientation::Local, Mode::Append);
        transform.translate(Vec3::X, Orientation::Global, Mode::Append);

        assert_vec3_eq(transform.position, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    pub fn local_scale_keeps_input_sign() {
        let mut transform = Transform::IDENTITY;
        transform.rotate_by(
            Quat::from_rotation_z(FRAC_PI_2),
            Orientation::Global,
            Mode::Replace,
        );
        transform.scale(Vec3::new(2.0, 3.0, 1.0), Orientation::Local, Mode::Replace);

        assert_vec3_eq(transform.scale, Vec3::new(3.0, 2.0, 1.0));
    }

    #[test]
    pub fn global_and_local_rotation_order() {
        let yaw = Quat::from_rotation_y(FRAC_PI_2);
        let roll = Quat::from_rotation_z(FRAC_PI_2);

        let mut global = Transform::IDENTITY;
        global.rotate_by(yaw, Orientation::Global, Mode::Replace);
        global.rotate_by(roll, Orientation::Global, Mode::Append);

        let mut local = Transform::IDENTITY;
        local.rotate_by(yaw, Orientation::Global, Mode::Replace);
        local.rotate_by(roll, Orientation::Local, Mode::Append);

        assert!(global.rotation.abs_diff_eq(roll * yaw, 1e-5));
        assert!(local.rotation.abs_diff_eq(yaw * roll, 1e-5));
    }

    #[test]
    pub fn instance_matrix_is_row_major() {
        let transform = Transform {
            position: Vec3::new(7.0, 8.0, 9.0),
            ..Transform::IDENTITY
        };

        assert_eq!(
            transform.to_instance_matrix(),
            [1.0, 0.0, 0.0, 7.0, 0.0, 1.0, 0.0, 8.0, 0.0, 0.0, 1.0, 9.0]
        );
    }
}
