//! Uwatec Memomouse record parser.
//!
//! Decodes one raw dive record into its header fields and its sample
//! stream. Records carry their timestamp in device ticks since power-on,
//! so the parser is anchored with a `(devtime, systime)` pair captured at
//! download time: the device's tick counter and the host's Unix clock at
//! the same moment.
//!
//! The sample stream is a run of big-endian 16-bit words, one per 20
//! seconds: the high 10 bits are the depth, the low 6 bits warning flags.
//! Once a minute the stream interleaves a small vendor blob with
//! decompression data, one byte longer on the oxygen series.

use chrono::{DateTime, Local, TimeZone};

use crate::core::array::{u16_be, u32_le};
use crate::core::checksum::bcd_decode;
use crate::error::{Error, Result};

/// Seconds between two consecutive samples.
const SAMPLE_INTERVAL: u32 = 20;

/// Byte offset of the tick timestamp inside a record.
const TIMESTAMP_OFFSET: usize = 11;

/// Model series, selected by the high nibble of the model byte.
#[derive(Debug, Clone, Copy)]
struct Model(u8);

impl Model {
    fn is_nitrox(self) -> bool {
        self.0 & 0xF0 == 0xF0
    }

    fn is_oxygen(self) -> bool {
        self.0 & 0xF0 == 0xA0
    }

    /// Record header length; the nitrox and oxygen series carry extra
    /// gas fields before the samples start.
    fn header_len(self) -> usize {
        let mut header = 22;
        if self.is_nitrox() {
            header += 2;
        }
        if self.is_oxygen() {
            header += 3;
        }
        header
    }
}

/// Header fields decodable from a dive record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    DiveTime,
    MaxDepth,
    GasMixCount,
    GasMix,
}

/// A decoded header field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Total dive time in seconds.
    DiveTime(u32),

    /// Maximum depth in metres.
    MaxDepth(f64),

    /// Number of breathing gas mixes.
    GasMixCount(u32),

    /// One breathing gas mix.
    GasMix(GasMix),
}

/// A breathing gas mix as volume fractions; the three sum to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasMix {
    pub oxygen: f64,
    pub helium: f64,
    pub nitrogen: f64,
}

/// One element of the sample stream, emitted in ascending time order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample<'a> {
    /// Elapsed seconds since the start of the dive.
    Time(u32),

    /// Depth in metres.
    Depth(f64),

    /// A warning active at the current time.
    Event(SampleEvent),

    /// Undecoded vendor bytes (decompression data).
    Vendor(&'a [u8]),
}

/// Warning flags carried in the low bits of each sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEvent {
    /// Missed decompression stop.
    DecoStop,

    /// Remaining bottom time too short (Air series only).
    Rbt,

    /// Ascent too fast.
    Ascent,

    /// Ceiling violation of the deco stop.
    Ceiling,

    /// Work too hard (Air series only).
    Workload,

    /// Transmit error of the air pressure (always set off the Air series).
    Transmitter,
}

/// Warning events by bit position.
const WARNINGS: [SampleEvent; 6] = [
    SampleEvent::DecoStop,
    SampleEvent::Rbt,
    SampleEvent::Ascent,
    SampleEvent::Ceiling,
    SampleEvent::Workload,
    SampleEvent::Transmitter,
];

/// Parser for one raw Memomouse dive record.
pub struct MemomouseParser {
    data: Vec<u8>,
    devtime: u32,
    systime: i64,
}

impl MemomouseParser {
    /// Creates a parser over one raw dive record.
    pub fn new(data: Vec<u8>, devtime: u32, systime: i64) -> Self {
        Self {
            data,
            devtime,
            systime,
        }
    }

    /// Reconstructs the dive's start as local wall-clock time.
    pub fn datetime(&self) -> Result<DateTime<Local>> {
        if self.data.len() < TIMESTAMP_OFFSET + 4 {
            return Err(Error::DataFormat);
        }
        let timestamp = u32_le(&self.data[TIMESTAMP_OFFSET..]);

        // The device clock ticks twice per second.
        let ticks = self.systime - (self.devtime.wrapping_sub(timestamp) / 2) as i64;
        Local
            .timestamp_opt(ticks, 0)
            .single()
            .ok_or(Error::DataFormat)
    }

    /// Decodes one header field.
    pub fn field(&self, kind: FieldType) -> Result<FieldValue> {
        let data = &self.data;
        if data.len() < 18 {
            return Err(Error::DataFormat);
        }
        let model = Model(data[3]);

        match kind {
            FieldType::DiveTime => {
                // Dives past 100 minutes overflow the two BCD digits into
                // a flag bit.
                let overflow = if data[4] & 0x04 != 0 { 100 } else { 0 };
                Ok(FieldValue::DiveTime((overflow + bcd_decode(data[5])) * 60))
            }
            FieldType::MaxDepth => {
                let raw = (u16_be(&data[6..]) & 0xFFC0) >> 6;
                Ok(FieldValue::MaxDepth(raw as f64 * 10.0 / 64.0))
            }
            FieldType::GasMixCount => Ok(FieldValue::GasMixCount(1)),
            FieldType::GasMix => {
                let oxygen = if data.len() >= model.header_len() + 18 {
                    if model.is_oxygen() {
                        data[41] as f64 / 100.0
                    } else if model.is_nitrox() {
                        // Nibble-coded nitrox: 20% + 2% per step, zero
                        // meaning plain air.
                        let step = data[41] & 0x0F;
                        if step != 0 {
                            (20.0 + 2.0 * step as f64) / 100.0
                        } else {
                            0.21
                        }
                    } else {
                        0.21
                    }
                } else {
                    0.21
                };
                Ok(FieldValue::GasMix(GasMix {
                    oxygen,
                    helium: 0.0,
                    nitrogen: 1.0 - oxygen,
                }))
            }
        }
    }

    /// Walks the sample stream, invoking the callback for every sample.
    ///
    /// Each 20-second step yields a time sample, a depth sample and one
    /// event sample per active warning bit; every full minute adds a
    /// vendor sample. A record that ends inside a vendor blob fails with
    /// a data-format error.
    pub fn samples<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Sample<'_>),
    {
        let data = &self.data;
        if data.len() < 18 {
            return Err(Error::DataFormat);
        }
        let model = Model(data[3]);

        let mut time = SAMPLE_INTERVAL;
        let mut offset = model.header_len() + 18;
        while offset + 2 <= data.len() {
            let value = u16_be(&data[offset..]);
            let depth = (value & 0xFFC0) >> 6;
            let warnings = value & 0x3F;
            offset += 2;

            callback(Sample::Time(time));
            callback(Sample::Depth(depth as f64 * 10.0 / 64.0));

            for (bit, event) in WARNINGS.iter().enumerate() {
                if warnings & (1 << bit) != 0 {
                    callback(Sample::Event(*event));
                }
            }

            // Once a minute the stream interleaves decompression data,
            // with an extra oxygen byte on the O2 series.
            if time % 60 == 0 {
                let start = offset;
                offset += 1;
                if model.is_oxygen() {
                    offset += 1;
                }
                if offset > data.len() {
                    return Err(Error::DataFormat);
                }
                callback(Sample::Vendor(&data[start..offset]));
            }

            time += SAMPLE_INTERVAL;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An owned mirror of [`Sample`] for collecting callback output.
    #[derive(Debug, Clone, PartialEq)]
    enum Owned {
        Time(u32),
        Depth(f64),
        Event(SampleEvent),
        Vendor(Vec<u8>),
    }

    fn collect(parser: &MemomouseParser) -> Vec<Owned> {
        let mut samples = Vec::new();
        parser
            .samples(|sample| {
                samples.push(match sample {
                    Sample::Time(t) => Owned::Time(t),
                    Sample::Depth(d) => Owned::Depth(d),
                    Sample::Event(e) => Owned::Event(e),
                    Sample::Vendor(v) => Owned::Vendor(v.to_vec()),
                })
            })
            .unwrap();
        samples
    }

    /// A record header for the given model byte, samples not included.
    fn record(model: u8) -> Vec<u8> {
        let mut data = vec![0u8; Model(model).header_len() + 18];
        data[3] = model;
        data
    }

    #[test]
    fn test_datetime_anchoring() {
        let mut data = record(0x10);
        data[11..15].copy_from_slice(&4000u32.to_le_bytes());

        let systime = 1_200_000_000;
        let parser = MemomouseParser::new(data, 10_000, systime);

        // 6000 ticks at two per second puts the dive 3000 s before download.
        let expected = Local.timestamp_opt(systime - 3000, 0).unwrap();
        assert_eq!(parser.datetime().unwrap(), expected);
    }

    #[test]
    fn test_datetime_truncated_record() {
        let parser = MemomouseParser::new(vec![0u8; 14], 0, 0);
        assert!(matches!(parser.datetime(), Err(Error::DataFormat)));
    }

    #[test]
    fn test_divetime() {
        let mut data = record(0x10);
        data[5] = 0x42; // BCD 42 minutes
        let parser = MemomouseParser::new(data.clone(), 0, 0);
        assert_eq!(
            parser.field(FieldType::DiveTime).unwrap(),
            FieldValue::DiveTime(42 * 60)
        );

        // The hundred-minutes overflow bit.
        data[4] |= 0x04;
        let parser = MemomouseParser::new(data, 0, 0);
        assert_eq!(
            parser.field(FieldType::DiveTime).unwrap(),
            FieldValue::DiveTime(142 * 60)
        );
    }

    #[test]
    fn test_maxdepth() {
        let mut data = record(0x10);
        // Raw depth 320 in the high 10 bits: 320 * 10 / 64 = 50 m.
        data[6] = 0x50;
        data[7] = 0x00;
        let parser = MemomouseParser::new(data.clone(), 0, 0);
        assert_eq!(
            parser.field(FieldType::MaxDepth).unwrap(),
            FieldValue::MaxDepth(50.0)
        );

        // The warning bits below the depth field do not change it.
        data[7] = 0x3F;
        let parser = MemomouseParser::new(data, 0, 0);
        assert_eq!(
            parser.field(FieldType::MaxDepth).unwrap(),
            FieldValue::MaxDepth(50.0)
        );
    }

    #[test]
    fn test_gasmix_air_model() {
        let parser = MemomouseParser::new(record(0x10), 0, 0);
        assert_eq!(
            parser.field(FieldType::GasMixCount).unwrap(),
            FieldValue::GasMixCount(1)
        );

        let FieldValue::GasMix(mix) = parser.field(FieldType::GasMix).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(mix.oxygen, 0.21);
        assert_eq!(mix.helium, 0.0);
        assert!((mix.oxygen + mix.helium + mix.nitrogen - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_gasmix_nitrox_model() {
        let mut data = record(0xF3);
        data[41] = 0x08; // 20% + 2% * 8 = 36%
        let parser = MemomouseParser::new(data.clone(), 0, 0);
        let FieldValue::GasMix(mix) = parser.field(FieldType::GasMix).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(mix.oxygen, 0.36);

        // A zero nibble means plain air.
        data[41] = 0x00;
        let parser = MemomouseParser::new(data, 0, 0);
        let FieldValue::GasMix(mix) = parser.field(FieldType::GasMix).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(mix.oxygen, 0.21);
    }

    #[test]
    fn test_gasmix_oxygen_model() {
        let mut data = record(0xA0);
        data[41] = 80;
        let parser = MemomouseParser::new(data, 0, 0);
        let FieldValue::GasMix(mix) = parser.field(FieldType::GasMix).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(mix.oxygen, 0.80);
    }

    #[test]
    fn test_samples_stream() {
        let mut data = record(0x10);
        // t=20: depth 64 (10 m), deco-stop and ascent warnings.
        data.extend_from_slice(&(((64u16) << 6) | 0b000101).to_be_bytes());
        // t=40: surface, no warnings.
        data.extend_from_slice(&[0x00, 0x00]);
        // t=60: depth 128 (20 m), followed by the per-minute vendor byte.
        data.extend_from_slice(&((128u16) << 6).to_be_bytes());
        data.push(0x7E);

        let parser = MemomouseParser::new(data, 0, 0);
        let samples = collect(&parser);
        assert_eq!(
            samples,
            vec![
                Owned::Time(20),
                Owned::Depth(10.0),
                Owned::Event(SampleEvent::DecoStop),
                Owned::Event(SampleEvent::Ascent),
                Owned::Time(40),
                Owned::Depth(0.0),
                Owned::Time(60),
                Owned::Depth(20.0),
                Owned::Vendor(vec![0x7E]),
            ]
        );
    }

    #[test]
    fn test_samples_time_cadence() {
        let mut data = record(0x10);
        for _ in 0..5 {
            data.extend_from_slice(&[0x00, 0x00]);
        }
        data.insert(data.len() - 4, 0x00); // the t=60 vendor byte

        let parser = MemomouseParser::new(data, 0, 0);
        let times: Vec<u32> = collect(&parser)
            .into_iter()
            .filter_map(|sample| match sample {
                Owned::Time(t) => Some(t),
                _ => None,
            })
            .collect();

        // Strictly monotonic, exactly 20 seconds apart.
        assert_eq!(times, vec![20, 40, 60, 80, 100]);
    }

    #[test]
    fn test_samples_oxygen_vendor_blob() {
        let mut data = record(0xA0);
        data.extend_from_slice(&[0x00, 0x00]); // t=20
        data.extend_from_slice(&[0x00, 0x00]); // t=40
        data.extend_from_slice(&[0x00, 0x00]); // t=60
        data.extend_from_slice(&[0x11, 0x22]); // two vendor bytes

        let parser = MemomouseParser::new(data, 0, 0);
        let samples = collect(&parser);
        assert!(samples.contains(&Owned::Vendor(vec![0x11, 0x22])));
    }

    #[test]
    fn test_samples_missing_vendor_byte() {
        let mut data = record(0x10);
        data.extend_from_slice(&[0x00, 0x00]); // t=20
        data.extend_from_slice(&[0x00, 0x00]); // t=40
        data.extend_from_slice(&[0x00, 0x00]); // t=60, vendor byte absent

        let parser = MemomouseParser::new(data, 0, 0);
        assert!(matches!(parser.samples(|_| {}), Err(Error::DataFormat)));
    }

    #[test]
    fn test_samples_truncated_record() {
        let parser = MemomouseParser::new(vec![0u8; 17], 0, 0);
        assert!(matches!(parser.samples(|_| {}), Err(Error::DataFormat)));
    }
}
