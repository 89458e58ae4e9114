//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::Vector3;
use num_traits::Float;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Clamp a value between a minimum and maximum.
pub fn clamp<T>(value: &T, min: &T, max: &T) -> T
where
    T: Float,
{
    let mut ret = *value;

    if ret > *max {
        ret = *max
    }
    if ret < *min {
        ret = *min
    }

    ret
}

/// Clamp each component of a vector to a symmetric bound `[-bound_i, bound_i]`.
///
/// Components at or inside the bound are unchanged, components outside it are
/// truncated while keeping their sign.
pub fn clamp_abs_vec3(value: &Vector3<f64>, bound: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(
        clamp(&value.x, &-bound.x.abs(), &bound.x.abs()),
        clamp(&value.y, &-bound.y.abs(), &bound.y.abs()),
        clamp(&value.z, &-bound.z.abs(), &bound.z.abs()),
    )
}

/// Get the signed angular distance between two angles in the range of [0, 2pi].
///
/// This function will return the shortest signed distance between a and b
/// accounting for wrapping between 0 and 2pi.
pub fn get_ang_dist_2pi<T>(a: T, b: T) -> T
where
    T: Float,
{
    let tau_t: T = T::from(std::f64::consts::TAU).unwrap();

    let c = rem_euclid(a - b, tau_t);
    let d = rem_euclid(b - a, tau_t);

    if c < d {
        -c
    } else {
        d
    }
}

/// Calculates the least nonnegative remainder of `lhs (mod rhs)`.
///
/// This function is taken from the std library as num is missing it.
pub fn rem_euclid<T>(lhs: T, rhs: T) -> T
where
    T: Float,
{
    let r = lhs % rhs;
    if r < T::from(0.0).unwrap() {
        r + rhs.abs()
    } else {
        r
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_ang_dist_2pi() {
        const TAU: f64 = std::f64::consts::TAU;

        assert_eq!(get_ang_dist_2pi(1f64, 2f64), 1f64);
        assert_eq!(get_ang_dist_2pi(2f64, 1f64), -1f64);
        assert_eq!(get_ang_dist_2pi(0f64, TAU), 0f64);
        assert_eq!(get_ang_dist_2pi(TAU, 0f64), 0f64);
        assert_eq!(get_ang_dist_2pi(1f64, TAU), -1f64);
        assert_eq!(get_ang_dist_2pi(0f64, TAU - 1f64), -1f64);
        assert_eq!(get_ang_dist_2pi(TAU - 1f64, 1f64), 2f64);
    }

    #[test]
    fn test_clamp_abs_vec3() {
        let bound = Vector3::new(2.0, 2.0, 1.0);

        let inside = Vector3::new(1.0, -1.5, 0.5);
        assert_eq!(clamp_abs_vec3(&inside, &bound), inside);

        let outside = Vector3::new(3.0, -4.0, 2.0);
        assert_eq!(
            clamp_abs_vec3(&outside, &bound),
            Vector3::new(2.0, -2.0, 1.0)
        );
    }
}
