//! Linearisation of the 10k NTC thermistors read through the auxiliary ADC.

/// Auxiliary ADC codes at 0, 10, .. 90 degC.
pub const BREAKPOINTS: [u16; 10] = [
    22951, 19956, 16660, 13387, 10431, 7951, 5981, 4475, 3348, 2515,
];

/// Reported when the reading is above the 0 degC breakpoint (open sensor or
/// too cold to linearise).
pub const SATURATED_HIGH: u8 = 255;
/// Reported when the reading is below the 90 degC breakpoint (shorted sensor or
/// too hot to linearise).
pub const SATURATED_LOW: u8 = 127;

/// Maps a raw auxiliary ADC code to a temperature in whole degC.
pub fn scale(reading: u16) -> u8 {
    if reading > BREAKPOINTS[0] {
        return SATURATED_HIGH;
    }
    if reading < BREAKPOINTS[BREAKPOINTS.len() - 1] {
        return SATURATED_LOW;
    }

    let mut temperature = 0u8;
    let mut bucket = 1;
    while bucket < BREAKPOINTS.len() - 1 {
        if reading > BREAKPOINTS[bucket] {
            break;
        }
        temperature += 10;
        bucket += 1;
    }

    let upper = u32::from(BREAKPOINTS[bucket - 1]);
    let lower = u32::from(BREAKPOINTS[bucket]);
    let offset = u32::from(reading) - lower;
    temperature + 10 - (offset * 10 / (upper - lower)) as u8
}

/// True for the codes that do not carry a temperature.
pub fn is_saturated(code: u8) -> bool {
    code == SATURATED_HIGH || code == SATURATED_LOW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoints_map_to_their_decade() {
        for (i, breakpoint) in BREAKPOINTS.iter().enumerate() {
            assert_eq!(scale(*breakpoint), (i * 10) as u8, "breakpoint {i}");
        }
    }

    #[test]
    fn interpolates_inside_a_bucket() {
        // halfway between 20 and 30 degC, the fraction is truncated upward
        let reading = (16660 + 13387) / 2;
        assert_eq!(scale(reading), 26);
        assert_eq!(scale(10431 - 1), 41);
        assert_eq!(scale(7951 + 1), 50);
    }

    #[test]
    fn saturation() {
        assert_eq!(scale(22952), SATURATED_HIGH);
        assert_eq!(scale(u16::MAX), SATURATED_HIGH);
        assert_eq!(scale(2514), SATURATED_LOW);
        assert_eq!(scale(0), SATURATED_LOW);
    }

    #[test]
    fn monotonically_decreasing() {
        let mut previous = scale(BREAKPOINTS[0]);
        for reading in (BREAKPOINTS[9]..BREAKPOINTS[0]).rev() {
            let temperature = scale(reading);
            assert!(temperature >= previous, "reading {reading}");
            previous = temperature;
        }
    }
}
