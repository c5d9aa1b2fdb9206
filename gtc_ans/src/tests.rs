use super::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Draw `count` symbols from the distribution described by `freqs`, the way
/// the encoder-side histogram sees real plane data.
fn generate_symbols(freqs: &[u32], count: usize, rng: &mut StdRng) -> Vec<u8> {
    let total: u32 = freqs.iter().sum();
    let mut symbols = Vec::with_capacity(count);
    for _ in 0..count {
        let mut draw = rng.gen_range(0..total);
        let mut symbol = 0u8;
        for &freq in freqs {
            if draw < freq {
                break;
            }
            draw -= freq;
            symbol += 1;
        }
        symbols.push(symbol);
    }
    symbols
}

fn expected_table_arrays(freqs: &[u32]) -> (Vec<u8>, Vec<u16>, Vec<u16>) {
    let normalized = normalize_frequencies(freqs).expect("normalization should succeed");
    let mut symbols = vec![0u8; ANS_TABLE_SIZE as usize];
    let mut frequencies = vec![0u16; ANS_TABLE_SIZE as usize];
    let mut cumulative = vec![0u16; ANS_TABLE_SIZE as usize];
    let mut sum = 0usize;
    for (symbol, &freq) in normalized.iter().enumerate() {
        for offset in 0..freq as usize {
            symbols[sum + offset] = symbol as u8;
            frequencies[sum + offset] = freq as u16;
            cumulative[sum + offset] = sum as u16;
        }
        sum += freq as usize;
    }
    assert_eq!(sum, ANS_TABLE_SIZE as usize);
    (symbols, frequencies, cumulative)
}

fn assert_table_matches(table: &DecoderTable, freqs: &[u32]) {
    let (symbols, frequencies, cumulative) = expected_table_arrays(freqs);
    assert_eq!(table.symbols(), symbols.as_slice());
    assert_eq!(table.frequencies(), frequencies.as_slice());
    assert_eq!(table.cumulative_frequencies(), cumulative.as_slice());
}

#[test]
fn bit_writer_emits_little_endian_words() {
    let mut writer = BitWriter::new();
    writer.write(0x1234, 16);
    writer.write(0xbeef, 16);
    assert_eq!(writer.bytes_written(), 4);
    assert_eq!(writer.as_bytes(), &[0x34, 0x12, 0xef, 0xbe]);
}

#[test]
fn bit_writer_accumulates_partial_words() {
    let mut writer = BitWriter::new();
    writer.write(0b101, 3);
    assert_eq!(writer.bytes_written(), 0);
    writer.write(0x1fff, 13);
    assert_eq!(writer.bytes_written(), 2);
    let word = u16::from_le_bytes([writer.as_bytes()[0], writer.as_bytes()[1]]);
    assert_eq!(word, (0x1fff << 3) | 0b101);
}

#[test]
fn word_reversal_recovers_writes_backwards() {
    let values: Vec<u32> = vec![0x0001, 0x8000, 0x1234, 0xffff, 0x0abc];
    let mut writer = BitWriter::new();
    for &value in &values {
        writer.write(value, 16);
    }
    let reversed = reverse_words(writer.as_bytes()).expect("even stream");
    let mut reader = BitReader::new(&reversed);
    for &expected in values.iter().rev() {
        assert_eq!(reader.read(16).expect("read should succeed"), expected);
    }
    assert!(reader.is_exhausted());
}

#[test]
fn reader_underflow_is_malformed() {
    let mut reader = BitReader::new(&[0xaa, 0xbb]);
    assert_eq!(reader.read(16).expect("first word"), 0xbbaa);
    assert!(matches!(
        reader.read(16),
        Err(AnsError::MalformedStream(_))
    ));
}

#[test]
fn reverse_words_rejects_odd_length() {
    assert!(matches!(
        reverse_words(&[1, 2, 3]),
        Err(AnsError::MalformedStream(_))
    ));
}

#[test]
fn normalization_is_proportional_with_residue_repair() {
    let normalized = normalize_frequencies(&[3, 2, 1, 4, 3]).expect("normalize");
    assert_eq!(normalized, vec![473, 315, 158, 629, 473]);
    assert_eq!(normalized.iter().sum::<u32>(), ANS_TABLE_SIZE);
}

#[test]
fn normalization_preserves_zeros_and_observed_symbols() {
    let normalized = normalize_frequencies(&[1, 0, 1_000_000, 1, 0]).expect("normalize");
    assert_eq!(normalized[1], 0);
    assert_eq!(normalized[4], 0);
    assert!(normalized[0] >= 1);
    assert!(normalized[3] >= 1);
    assert_eq!(normalized.iter().sum::<u32>(), ANS_TABLE_SIZE);
}

#[test]
fn normalization_rejects_degenerate_tables() {
    assert!(matches!(
        normalize_frequencies(&[]),
        Err(AnsError::EmptyHistogram)
    ));
    assert!(matches!(
        normalize_frequencies(&[0, 0, 0]),
        Err(AnsError::EmptyHistogram)
    ));
    let oversized = vec![1u32; MAX_ALPHABET_SIZE + 1];
    assert!(matches!(
        normalize_frequencies(&oversized),
        Err(AnsError::AlphabetTooLarge(257))
    ));
}

#[test]
fn normalization_totality_over_random_tables() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..64 {
        let len = rng.gen_range(1..=MAX_ALPHABET_SIZE);
        let mut freqs: Vec<u32> = (0..len).map(|_| rng.gen_range(0..1000)).collect();
        let pin = rng.gen_range(0..len);
        freqs[pin] = freqs[pin].max(1);
        let normalized = normalize_frequencies(&freqs).expect("normalize");
        assert_eq!(normalized.iter().sum::<u32>(), ANS_TABLE_SIZE);
        for (raw, norm) in freqs.iter().zip(normalized.iter()) {
            if *raw == 0 {
                assert_eq!(*norm, 0);
            } else {
                assert!(*norm >= 1);
            }
        }
    }
}

#[test]
fn decoder_table_layout_is_range_packed() {
    let freqs = [3u32, 2, 1, 4, 3];
    let table = DecoderTable::new(&freqs).expect("table build");
    assert_table_matches(&table, &freqs);

    // Every slot must sit inside its symbol's cumulative range.
    let normalized = normalize_frequencies(&freqs).expect("normalize");
    let mut starts = vec![0u32; normalized.len()];
    let mut sum = 0u32;
    for (start, &freq) in starts.iter_mut().zip(normalized.iter()) {
        *start = sum;
        sum += freq;
    }
    for slot in 0..ANS_TABLE_SIZE as usize {
        let symbol = table.symbols()[slot] as usize;
        let start = starts[symbol];
        assert!(start as usize <= slot);
        assert!((slot as u32) < start + normalized[symbol]);
        assert_eq!(u32::from(table.frequencies()[slot]), normalized[symbol]);
    }
}

#[test]
fn decoder_table_rebuilds_in_place() {
    let mut table = DecoderTable::new(&[3, 2, 1, 4, 3]).expect("table build");
    let new_freqs = [80u32, 300, 2, 14, 1, 1, 1, 20];
    table.rebuild(&new_freqs).expect("rebuild");
    assert_table_matches(&table, &new_freqs);
}

#[test]
fn single_stream_roundtrip_decodes_in_reverse() {
    let freqs = [12u32, 14, 17, 1, 1, 2, 372];
    let mut rng = StdRng::seed_from_u64(0);
    let symbols = generate_symbols(&freqs, 256, &mut rng);

    let model = EncoderModel::new(&freqs).expect("model");
    let mut writer = BitWriter::new();
    let mut encoder = Encoder::new(&model);
    for &symbol in &symbols {
        encoder.encode(symbol, &mut writer).expect("encode");
    }
    let stream = writer.into_bytes();
    assert_eq!(stream.len() % 2, 0);

    let reversed = reverse_words(&stream).expect("even stream");
    let table = DecoderTable::new(&freqs).expect("table");
    let decode_pass = |state: u32| {
        let mut reader = BitReader::new(&reversed);
        let mut decoder = Decoder::new(&table, state).expect("decoder");
        let mut decoded = Vec::with_capacity(symbols.len());
        for _ in 0..symbols.len() {
            decoded.push(decoder.decode(&mut reader).expect("decode"));
        }
        decoded
    };

    let mut first = decode_pass(encoder.state());
    let second = decode_pass(encoder.state());
    assert_eq!(first, second);
    first.reverse();
    assert_eq!(first, symbols);
}

#[test]
fn interleaved_roundtrip_24_streams() {
    let freqs = [
        32u32, 186, 54, 8, 94, 35, 13, 21, 456, 789, 33, 215, 6, 54, 987, 54, 65, 13, 2, 1,
    ];
    let mut rng = StdRng::seed_from_u64(0);
    let streams: Vec<Vec<u8>> = (0..24)
        .map(|_| generate_symbols(&freqs, 256, &mut rng))
        .collect();
    let refs: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();

    let model = EncoderModel::new(&freqs).expect("model");
    let encoded = encode_interleaved(&refs, &model).expect("interleaved encode");
    assert_eq!(encoded.bytes.len() % 2, 0);
    assert_eq!(encoded.states.len(), 24);

    let table = DecoderTable::new(&freqs).expect("table");
    let lens = vec![256usize; 24];
    let decoded =
        decode_interleaved(&encoded.bytes, &encoded.states, &lens, &table).expect("decode");
    assert_eq!(decoded, streams);
}

#[test]
fn interleaved_roundtrip_across_stream_counts() {
    let freqs = [40u32, 12, 300, 7, 7, 90, 1, 600];
    let model = EncoderModel::new(&freqs).expect("model");
    let table = DecoderTable::new(&freqs).expect("table");
    for &count in &[1usize, 2, 4, 24, 32] {
        let mut rng = StdRng::seed_from_u64(count as u64);
        let streams: Vec<Vec<u8>> = (0..count)
            .map(|_| generate_symbols(&freqs, 256, &mut rng))
            .collect();
        let refs: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
        let encoded = encode_interleaved(&refs, &model).expect("encode");
        assert_eq!(encoded.bytes.len() % 2, 0, "count {count}");
        let lens = vec![256usize; count];
        let decoded =
            decode_interleaved(&encoded.bytes, &encoded.states, &lens, &table).expect("decode");
        assert_eq!(decoded, streams, "count {count}");
    }
}

#[test]
fn interleaved_roundtrip_with_ragged_rank_lengths() {
    let freqs = [5u32, 11, 2, 40];
    let model = EncoderModel::new(&freqs).expect("model");
    let table = DecoderTable::new(&freqs).expect("table");
    let mut rng = StdRng::seed_from_u64(3);
    // Strided plane splits hand the leading ranks one extra symbol.
    let lens = [9usize, 9, 8, 8];
    let streams: Vec<Vec<u8>> = lens
        .iter()
        .map(|&len| generate_symbols(&freqs, len, &mut rng))
        .collect();
    let refs: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
    let encoded = encode_interleaved(&refs, &model).expect("encode");
    let decoded =
        decode_interleaved(&encoded.bytes, &encoded.states, &lens, &table).expect("decode");
    assert_eq!(decoded, streams);
}

#[test]
fn truncated_stream_is_malformed() {
    let freqs = [9u32, 1, 30, 77];
    let model = EncoderModel::new(&freqs).expect("model");
    let table = DecoderTable::new(&freqs).expect("table");
    let mut rng = StdRng::seed_from_u64(11);
    let streams: Vec<Vec<u8>> = (0..4)
        .map(|_| generate_symbols(&freqs, 128, &mut rng))
        .collect();
    let refs: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
    let encoded = encode_interleaved(&refs, &model).expect("encode");
    assert!(encoded.bytes.len() >= 4);

    let truncated = &encoded.bytes[..encoded.bytes.len() - 2];
    let lens = vec![128usize; 4];
    let result = decode_interleaved(truncated, &encoded.states, &lens, &table);
    assert!(matches!(result, Err(AnsError::MalformedStream(_))));
}

#[test]
fn flipped_bit_is_detected() {
    let freqs = [9u32, 1, 30, 77, 240, 3];
    let model = EncoderModel::new(&freqs).expect("model");
    let table = DecoderTable::new(&freqs).expect("table");
    let mut rng = StdRng::seed_from_u64(21);
    let streams: Vec<Vec<u8>> = (0..8)
        .map(|_| generate_symbols(&freqs, 256, &mut rng))
        .collect();
    let refs: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
    let encoded = encode_interleaved(&refs, &model).expect("encode");

    let mut corrupted = encoded.bytes.clone();
    let target = corrupted.len() / 2;
    corrupted[target] ^= 0x10;
    let lens = vec![256usize; 8];
    let result = decode_interleaved(&corrupted, &encoded.states, &lens, &table);
    assert!(matches!(result, Err(AnsError::MalformedStream(_))));
}

#[test]
fn decoder_rejects_out_of_range_initial_state() {
    let table = DecoderTable::new(&[1, 1]).expect("table");
    assert!(Decoder::new(&table, ANS_TABLE_SIZE - 1).is_err());
    assert!(Decoder::new(&table, 1 << 27).is_err());
    assert!(Decoder::new(&table, ANS_TABLE_SIZE).is_ok());
}

#[test]
fn encoding_an_unobserved_symbol_fails() {
    let freqs = [10u32, 0, 5];
    let model = EncoderModel::new(&freqs).expect("model");
    let mut writer = BitWriter::new();
    let mut encoder = Encoder::new(&model);
    assert!(matches!(
        encoder.encode(1, &mut writer),
        Err(AnsError::ZeroFrequencySymbol(1))
    ));
    assert!(matches!(
        encoder.encode(200, &mut writer),
        Err(AnsError::ZeroFrequencySymbol(200))
    ));
}

#[test]
fn single_symbol_alphabet_needs_no_stream_bytes() {
    let freqs = [0u32, 0, 64];
    let model = EncoderModel::new(&freqs).expect("model");
    let table = DecoderTable::new(&freqs).expect("table");
    let symbols = vec![2u8; 500];
    let encoded = encode_interleaved(&[&symbols], &model).expect("encode");
    assert!(encoded.bytes.is_empty());
    let decoded =
        decode_interleaved(&encoded.bytes, &encoded.states, &[500], &table).expect("decode");
    assert_eq!(decoded[0], symbols);
}
