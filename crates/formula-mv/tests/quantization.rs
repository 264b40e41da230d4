use formula_mv::{bits_required, Quantization, QuantizedColumn};

const MINUTE_MS: i64 = 60_000;

fn assert_round_trip(quantization: Quantization, min: i64, max: i64, step: i64) {
    let factor = quantization.factor();
    let col = QuantizedColumn::new(quantization, min, max, 0).expect("valid range");
    let mut v = min;
    while v <= max {
        let decoded = col.decode(col.encode(v));
        assert!(
            (decoded - v).abs() * 2 <= factor,
            "{quantization:?}: {v} decoded as {decoded}"
        );
        v += step;
    }
}

#[test]
fn decoded_values_stay_within_half_a_bucket() {
    let day = 24 * 60 * MINUTE_MS;
    assert_round_trip(Quantization::Date, 0, 7 * day, 7 * MINUTE_MS + 3);
    assert_round_trip(Quantization::Date, -3 * day, day, 11 * MINUTE_MS);
    assert_round_trip(Quantization::Time, 0, day - 1, 997);
    assert_round_trip(Quantization::Timestamp, 1_600_000_000_000, 1_600_000_600_000, 1_237);
    assert_round_trip(Quantization::Integer, -1_000, 1_000, 1);
}

#[test]
fn aligned_bounds_are_exact() {
    for (quantization, min, max) in [
        (Quantization::Date, 30 * MINUTE_MS, 90 * 24 * 60 * MINUTE_MS),
        (Quantization::Time, 1_000, 86_399_000),
        (Quantization::Timestamp, 1_600_000_000_000, 1_700_000_000_000),
        (Quantization::Integer, -77, 12_345),
    ] {
        let col = QuantizedColumn::new(quantization, min, max, 0).unwrap();
        assert_eq!(col.decode(col.encode(min)), min, "{quantization:?} min");
        assert_eq!(col.decode(col.encode(max)), max, "{quantization:?} max");
    }
}

#[test]
fn unaligned_bounds_keep_min_exact() {
    for (quantization, min, max) in [
        (Quantization::Date, 1_000, 1_000 + 4 * 30 * MINUTE_MS),
        (Quantization::Date, -7 * MINUTE_MS, 5 * 24 * 60 * MINUTE_MS + 13),
        (Quantization::Time, 1, 60_001),
    ] {
        let col = QuantizedColumn::new(quantization, min, max, 0).unwrap();
        assert_eq!(col.decode(col.encode(min)), min, "{quantization:?} min");
        assert_eq!(col.decode(col.encode(max)), max, "{quantization:?} max");
    }
    let date = QuantizedColumn::new(Quantization::Date, 1_000, 1_000 + 4 * 30 * MINUTE_MS, 0)
        .unwrap();
    assert_eq!(date.bit_width(), bits_required(4));
    // A partial last bucket still gets its own code.
    let ragged = QuantizedColumn::new(Quantization::Date, 0, 4 * 30 * MINUTE_MS + 1, 0).unwrap();
    assert_eq!(ragged.bit_width(), bits_required(5));
}

#[test]
fn stored_values_decode_through_get() {
    let mut col = QuantizedColumn::new(Quantization::Time, 0, 61_000, 61).unwrap();
    for row in 0..61 {
        col.set(row, row as i64 * 1_000 + 499).unwrap();
    }
    for row in 0..61 {
        assert_eq!(col.get(row).unwrap(), row as i64 * 1_000);
    }
}

#[test]
fn width_is_derived_from_quantized_range() {
    // 0..=1440 half-hour buckets in 30 days.
    let month = QuantizedColumn::new(Quantization::Date, 0, 30 * 24 * 60 * MINUTE_MS, 0).unwrap();
    assert_eq!(month.bit_width(), bits_required(1440));
    assert_eq!(month.bit_width(), 11);

    // Range-relative storage does not depend on where the range starts.
    let shifted =
        QuantizedColumn::new(Quantization::Integer, 1 << 40, (1 << 40) + 255, 0).unwrap();
    assert_eq!(shifted.bit_width(), 8);
}
