//! Conversions between the driver's raw coordinate and the
//! direction-normalized logical coordinate, plus step/percent math.
//!
//! Logical 0 is fully open; logical `travel_steps` is fully closed.

pub fn direction_sign(reverse_direction: bool) -> i32 {
    if reverse_direction {
        -1
    } else {
        1
    }
}

pub fn to_raw(logical: i32, reverse_direction: bool) -> i32 {
    logical * direction_sign(reverse_direction)
}

/// Self-inverse with `to_raw` since the sign is always 1 or -1.
pub fn to_logical(raw: i32, reverse_direction: bool) -> i32 {
    raw * direction_sign(reverse_direction)
}

pub fn clamp_i32(value: i32, min_value: i32, max_value: i32) -> i32 {
    if value < min_value {
        min_value
    } else if value > max_value {
        max_value
    } else {
        value
    }
}

pub fn clamp_f32(value: f32, min_value: f32, max_value: f32) -> f32 {
    if value < min_value {
        min_value
    } else if value > max_value {
        max_value
    } else {
        value
    }
}

pub fn clamp_f64(value: f64, min_value: f64, max_value: f64) -> f64 {
    if value < min_value {
        min_value
    } else if value > max_value {
        max_value
    } else {
        value
    }
}

pub fn steps_to_percent(steps: i32, travel_steps: i32) -> f32 {
    if travel_steps <= 0 {
        return 0.0;
    }
    100.0 * steps as f32 / travel_steps as f32
}

/// Saturating conversion: over-range percent clamps rather than rejects.
/// Endpoint-level strict validation is a separate layer on top of this.
pub fn percent_to_steps(percent: f32, travel_steps: i32) -> i32 {
    if travel_steps <= 0 {
        return 0;
    }
    let clamped = clamp_f32(percent, 0.0, 100.0);
    ((clamped / 100.0) * travel_steps as f32).round() as i32
}
