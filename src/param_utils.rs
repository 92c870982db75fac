use std::collections::HashMap;

/// Converts a period parameter; only whole numbers >= 1 are accepted, nothing is rounded
pub fn period_param(name: &str, value: f64) -> Result<usize, String> {
    if value.is_finite() && value >= 1.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Ok(value as usize)
    } else {
        Err(format!(
            "{} must be a whole number of at least 1 (value: {})",
            name, value
        ))
    }
}

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// First key present wins; lets strategies accept both snake_case and camelCase names
pub fn first_param<'a>(params: &'a HashMap<String, f64>, keys: &[&str]) -> Option<&'a f64> {
    keys.iter().find_map(|key| params.get(*key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_must_be_whole_and_positive() {
        assert_eq!(period_param("period", 14.0), Ok(14));
        assert_eq!(period_param("period", 1.0), Ok(1));
        assert!(period_param("period", 13.6).is_err());
        assert!(period_param("period", 0.0).is_err());
        assert!(period_param("period", -3.0).is_err());
        assert!(period_param("period", f64::NAN).is_err());
        assert!(period_param("period", f64::INFINITY).is_err());
        let message = period_param("short_period", -5.0).unwrap_err();
        assert!(message.contains("short_period"));
        assert!(message.contains("-5"));
    }

    #[test]
    fn first_param_prefers_earlier_keys() {
        let mut params = HashMap::new();
        params.insert("shortPeriod".to_string(), 3.0);
        params.insert("short_period".to_string(), 5.0);
        assert_eq!(
            first_param(&params, &["short_period", "shortPeriod"]),
            Some(&5.0)
        );
        assert_eq!(first_param(&params, &["long_period"]), None);
    }
}
