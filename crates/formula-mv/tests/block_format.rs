use byteorder::{LittleEndian, WriteBytesExt};
use formula_mv::{
    write_value, Block, BlockBuilder, BlockMeta, Channel, ColumnInfo, ColumnSpec, Dictionary,
    FileChannel, MvError, Quantization, Value,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const HALF_HOUR_MS: i64 = 1_800_000;

fn header_bytes() -> Vec<u8> {
    let dict = Dictionary::from_values([Value::from("east"), Value::from("west"), Value::Null]);
    let mut out = Vec::new();
    out.write_i32::<LittleEndian>(42).unwrap();
    out.write_i32::<LittleEndian>(3).unwrap();

    // Dimension column with a dictionary.
    write_value(&mut out, &Value::from("east")).unwrap();
    write_value(&mut out, &Value::from("west")).unwrap();
    out.write_u8(1).unwrap();
    dict.write_to(&mut out).unwrap();
    out.write_u8(0).unwrap();

    // Float measure.
    write_value(&mut out, &Value::Float(-2.5)).unwrap();
    write_value(&mut out, &Value::Float(1e9)).unwrap();
    out.write_u8(0).unwrap();
    out.write_u8(1).unwrap();

    // Date measure with no statistics yet.
    write_value(&mut out, &Value::Null).unwrap();
    write_value(&mut out, &Value::Date(HALF_HOUR_MS)).unwrap();
    out.write_u8(0).unwrap();
    out.write_u8(0).unwrap();
    out
}

#[test]
fn block_meta_rewrites_identical_bytes() {
    let bytes = header_bytes();
    let meta = BlockMeta::from_bytes(&bytes).expect("parse header");
    assert_eq!(meta.row_count, 42);
    assert_eq!(meta.column_count(), 3);
    assert_eq!(
        meta.column(0).unwrap().dictionary.as_ref().map(|d| d.len()),
        Some(3)
    );
    assert!(meta.column(1).unwrap().is_number);

    assert_eq!(meta.to_bytes().expect("write header"), bytes);
}

#[test]
fn truncated_header_is_an_error() {
    let bytes = header_bytes();
    let err = BlockMeta::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
    assert!(matches!(err, MvError::Io(_) | MvError::Corrupt(_)), "{err:?}");
}

#[test]
fn unknown_value_tag_is_reported() {
    let mut bytes = Vec::new();
    bytes.write_i32::<LittleEndian>(1).unwrap();
    bytes.write_i32::<LittleEndian>(1).unwrap();
    bytes.push(0x7f);
    assert!(matches!(
        BlockMeta::from_bytes(&bytes),
        Err(MvError::UnknownValueTag(0x7f))
    ));
}

fn sample_rows() -> Vec<[Value; 4]> {
    (0..500i64)
        .map(|row| {
            let region = match row % 4 {
                0 => Value::from("north"),
                1 => Value::from("south"),
                2 => Value::from("east"),
                _ => Value::Null,
            };
            [
                region,
                Value::Int(row % 7),
                Value::Int(row * 13 - 1_000),
                Value::Date(1_700_000_000_000 / HALF_HOUR_MS * HALF_HOUR_MS + row * HALF_HOUR_MS),
            ]
        })
        .collect()
}

fn build_sample() -> Block {
    let mut builder = BlockBuilder::new(vec![
        ColumnSpec::Dimension,
        ColumnSpec::Dimension,
        ColumnSpec::Measure(Quantization::Integer),
        ColumnSpec::Measure(Quantization::Date),
    ]);
    for row in sample_rows() {
        builder.append_row(&row).expect("append row");
    }
    builder.finish().expect("finish block")
}

#[test]
fn block_file_reopens_with_same_rows() {
    let dir = tempfile::tempdir().expect("temp dir");
    let channel = Arc::new(FileChannel::new(dir.path().join("blocks").join("b0.mvb")));

    let mut block = build_sample();
    block.write_to(channel.as_ref()).expect("write block");
    assert!(channel.exists());

    let mut reopened = Block::open(channel.clone()).expect("open block");
    assert_eq!(reopened.meta(), block.meta());
    assert_eq!(reopened.row_count(), 500);

    for (row, expected) in sample_rows().iter().enumerate() {
        for (col, value) in expected.iter().enumerate() {
            assert_eq!(&reopened.value(row, col).unwrap(), value, "row {row} col {col}");
        }
    }

    // Releasing the columns and reading again pages them back in.
    reopened.close();
    assert_eq!(reopened.value(499, 2).unwrap(), Value::Int(499 * 13 - 1_000));

    let rows = reopened.raw_rows(&[0, 1], &[2]).expect("decode rows");
    assert_eq!(rows.len(), 500);
    assert_eq!(rows[3].measures, vec![3.0 * 13.0 - 1_000.0]);

    channel.delete().expect("delete block file");
    assert!(!channel.exists());
}

#[test]
fn rewriting_a_smaller_block_drops_stale_bytes() {
    let dir = tempfile::tempdir().expect("temp dir");
    let channel = Arc::new(FileChannel::new(dir.path().join("b0.mvb")));
    build_sample().write_to(channel.as_ref()).expect("write large block");
    let large_len = std::fs::metadata(channel.path()).unwrap().len();

    let mut builder = BlockBuilder::new(vec![ColumnSpec::Measure(Quantization::Integer)]);
    builder.append_row(&[Value::Int(42)]).unwrap();
    let mut small = builder.finish().unwrap();
    small.write_to(channel.as_ref()).expect("write small block");

    let small_len = std::fs::metadata(channel.path()).unwrap().len();
    assert!(small_len < large_len);
    // Header, one directory slot, one measure column header; a constant column packs to zero bits.
    let expected_len = small.meta().to_bytes().unwrap().len() as u64 + 8 + 22;
    assert_eq!(small_len, expected_len);

    let mut reopened = Block::open(channel.clone()).expect("open block");
    assert_eq!(reopened.row_count(), 1);
    assert_eq!(reopened.value(0, 0).unwrap(), Value::Int(42));
}

#[test]
fn shared_dictionary_aligns_codes_across_blocks() {
    let dict = Arc::new(Dictionary::from_values(
        ["a", "b", "c"].into_iter().map(Value::from),
    ));
    let mut codes = Vec::new();
    for values in [["c", "a"], ["b", "c"]] {
        let mut builder = BlockBuilder::new(vec![ColumnSpec::Dimension])
            .with_dictionary(0, dict.clone());
        for v in values {
            builder.append_row(&[Value::from(v)]).unwrap();
        }
        let mut block = builder.finish().unwrap();
        for row in 0..block.row_count() {
            codes.push(block.dimension_code(row, 0).unwrap());
        }
    }
    assert_eq!(codes, vec![2, 0, 1, 2]);
}

#[test]
fn column_info_prunes_by_range() {
    let mut block = build_sample();
    let info: &ColumnInfo = block.meta().column(2).unwrap();
    assert!(info.may_contain(&Value::Int(0)));
    assert!(!info.may_contain(&Value::Int(10_000)));
    assert!(!info.overlaps(&Value::Int(-5_000), &Value::Int(-1_001)));

    let private = block.meta().deep_clone();
    block
        .attach_dictionary(1, Arc::new(Dictionary::default()))
        .unwrap();
    assert_ne!(private.column(1).unwrap(), block.meta().column(1).unwrap());
}
