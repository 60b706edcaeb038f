//! Byte-level record codec.
//!
//! A stored record is the fixed-width key image (the concatenation of each
//! dimension's order-preserving encoding) followed by each measure's
//! accumulator payload. Within a chunk, unsigned bytewise comparison of key
//! images matches [`PrimaryKey`] ordering.

use crate::{PrimaryKey, Record, Result, Schema};

impl Schema {
    /// Appends the fixed-width key image of `key` to `out`.
    pub fn encode_key(&self, key: &PrimaryKey, out: &mut Vec<u8>) -> Result<()> {
        self.validate_key(key)?;
        for (spec, value) in self.dimensions().iter().zip(key.values().iter()) {
            spec.key_type.encode(value, out)?;
        }
        Ok(())
    }

    /// Decodes a key image from the front of `bytes`.
    pub fn decode_key(&self, bytes: &[u8]) -> Result<PrimaryKey> {
        let mut values = Vec::with_capacity(self.dimensions().len());
        let mut offset = 0;
        for spec in self.dimensions() {
            values.push(spec.key_type.decode(&bytes[offset.min(bytes.len())..])?);
            offset += spec.key_type.encoded_len();
        }
        Ok(PrimaryKey::new(values))
    }

    /// Appends the full encoding of `record` to `out`.
    pub fn encode_record(&self, record: &Record, out: &mut Vec<u8>) -> Result<()> {
        self.encode_key(&record.key, out)?;
        for (spec, value) in self.measures().iter().zip(record.values.iter()) {
            spec.kind.encode_acc(value, out)?;
        }
        Ok(())
    }

    /// Decodes one record from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    pub fn decode_record(&self, bytes: &[u8]) -> Result<(Record, usize)> {
        let key = self.decode_key(bytes)?;
        let mut offset = self.key_width();
        let mut values = Vec::with_capacity(self.measures().len());
        for spec in self.measures() {
            let (value, consumed) = spec.kind.decode_acc(&bytes[offset.min(bytes.len())..])?;
            values.push(value);
            offset += consumed;
        }
        Ok((Record::new(key, values), offset))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        HllSketch, KeyType, MeasureKind, MeasureValue, NumType, PrimaryKey, Record, Schema, Value,
    };
    use std::collections::BTreeSet;

    fn schema() -> Schema {
        Schema::builder()
            .dimension("date", KeyType::Date)
            .dimension("campaign", KeyType::I32)
            .measure("impressions", MeasureKind::Sum(NumType::I64))
            .measure("spend", MeasureKind::Sum(NumType::F64))
            .measure("users", MeasureKind::Hll { precision: 6 })
            .measure("countries", MeasureKind::SetUnion(KeyType::U16))
            .build()
            .unwrap()
    }

    fn record() -> Record {
        let mut sketch = HllSketch::new(6);
        sketch.insert_hash(0x0123_4567_89AB_CDEF);
        Record::new(
            vec![Value::Date(19_000), Value::I32(-7)],
            vec![
                MeasureValue::I64(120),
                MeasureValue::F64(3.5),
                MeasureValue::Hll(sketch),
                MeasureValue::Set(BTreeSet::from([Value::U16(44), Value::U16(33)])),
            ],
        )
    }

    #[test]
    fn record_round_trips() {
        let schema = schema();
        let record = record();
        let mut bytes = vec![];
        schema.encode_record(&record, &mut bytes).unwrap();

        let (decoded, consumed) = schema.decode_record(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn key_image_order_matches_key_order() {
        let schema = schema();
        let keys = [
            PrimaryKey::new(vec![Value::Date(-5), Value::I32(100)]),
            PrimaryKey::new(vec![Value::Date(0), Value::I32(i32::MIN)]),
            PrimaryKey::new(vec![Value::Date(0), Value::I32(3)]),
            PrimaryKey::new(vec![Value::Date(12), Value::I32(-50)]),
        ];
        let images: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| {
                let mut out = vec![];
                schema.encode_key(k, &mut out).unwrap();
                out
            })
            .collect();
        for w in images.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn back_to_back_records_decode_sequentially() {
        let schema = schema();
        let record = record();
        let mut bytes = vec![];
        schema.encode_record(&record, &mut bytes).unwrap();
        let first_len = bytes.len();
        schema.encode_record(&record, &mut bytes).unwrap();

        let (_, consumed) = schema.decode_record(&bytes).unwrap();
        assert_eq!(consumed, first_len);
        let (second, _) = schema.decode_record(&bytes[consumed..]).unwrap();
        assert_eq!(second, record);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let schema = schema();
        let mut bytes = vec![];
        schema.encode_record(&record(), &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(schema.decode_record(&bytes).is_err());
    }
}
