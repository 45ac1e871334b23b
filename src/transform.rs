/// Pose of one sensor in the shared coordinate frame.
///
/// Yaw turns about the vertical (y) axis, pitch about the horizontal (x)
/// axis; there is no roll. The 3x4 matrix is `Ry(yaw) * Rx(pitch)` with the
/// translation in the last column, and is always derived from the five pose
/// values, never edited directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrinsicTransform {
    yaw: f64,
    pitch: f64,
    translation: [f64; 3],
    matrix: [[f64; 4]; 3],
}

impl ExtrinsicTransform {
    /// Build a transform from angles in radians and a translation in
    /// millimetres.
    pub fn from_pose(yaw: f64, pitch: f64, x: f64, y: f64, z: f64) -> ExtrinsicTransform {
        let (sa, ca) = yaw.sin_cos();
        let (sb, cb) = pitch.sin_cos();
        ExtrinsicTransform {
            yaw,
            pitch,
            translation: [x, y, z],
            matrix: [
                [ca, sa * sb, sa * cb, x],
                [0.0, cb, -sb, y],
                [-sa, ca * sb, ca * cb, z],
            ],
        }
    }

    /// Default placement of the `index`-th sensor: sensors face outward at
    /// 60 degree steps around the origin.
    pub fn default_for(index: usize) -> ExtrinsicTransform {
        Self::from_pose(index as f64 * std::f64::consts::FRAC_PI_3, 0.0, 0.0, 0.0, 0.0)
    }

    /// Map a point from sensor space to the shared frame.
    #[inline]
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        [
            m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + m[0][3],
            m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + m[1][3],
            m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + m[2][3],
        ]
    }

    pub fn yaw(&self) -> f64 {
        self.yaw
    }

    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    pub fn translation(&self) -> [f64; 3] {
        self.translation
    }

    pub fn matrix(&self) -> &[[f64; 4]; 3] {
        &self.matrix
    }
}

impl Default for ExtrinsicTransform {
    fn default() -> Self {
        Self::from_pose(0.0, 0.0, 0.0, 0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_3, PI};

    fn close(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_identity() {
        let t = ExtrinsicTransform::default();
        assert_eq!(t.apply([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_default_yaw_steps() {
        for i in 0..6 {
            let t = ExtrinsicTransform::default_for(i);
            assert_eq!(t.yaw(), i as f64 * FRAC_PI_3);
            assert_eq!(t.pitch(), 0.0);
            assert_eq!(t.translation(), [0.0; 3]);
        }
        // Second sensor: 60 degrees about the vertical axis.
        let m = ExtrinsicTransform::default_for(1);
        let (s, c) = FRAC_PI_3.sin_cos();
        assert!(close(m.apply([0.0, 0.0, 1.0]), [s, 0.0, c]));
        assert!(close(m.apply([0.0, 1.0, 0.0]), [0.0, 1.0, 0.0]));
    }

    #[test]
    fn test_recompute_is_bit_identical() {
        let a = ExtrinsicTransform::from_pose(0.3, -0.1, 10.0, 20.0, -30.0);
        let b = ExtrinsicTransform::from_pose(0.3, -0.1, 10.0, 20.0, -30.0);
        assert_eq!(a.matrix(), b.matrix());
    }

    #[test]
    fn test_pitch_and_translation() {
        // Pitching down a quarter turn sends +z to -y.
        let t = ExtrinsicTransform::from_pose(0.0, FRAC_PI_2, 0.0, 0.0, 0.0);
        assert!(close(t.apply([0.0, 0.0, 1.0]), [0.0, -1.0, 0.0]));

        let t = ExtrinsicTransform::from_pose(PI, 0.0, 5.0, 6.0, 7.0);
        assert!(close(t.apply([1.0, 0.0, 1.0]), [4.0, 6.0, 6.0]));
    }
}
