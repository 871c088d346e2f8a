//! Event-driven decoding of `/query` JSON bodies into [`Series`] frames.
//!
//! A day-sized batch reply can run to many megabytes; materializing a JSON
//! tree first would double or triple peak memory and force a second scan.
//! These decoders ride the deserializer's event stream instead, appending
//! cells straight to the frame's columnar buffers. Everything outside the
//! navigated path is skipped without allocation.

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use series_frame::Series;
use snafu::{ensure, ResultExt, Snafu};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Decoder failures.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum DecodeError {
    #[snafu(display("unexpected {kind} in column {col}"))]
    UnexpectedType { kind: &'static str, col: usize },

    #[snafu(display("response is not the expected influxdb shape: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("row cells do not tile {columns} columns (data length {data_len})"))]
    RaggedRows { data_len: usize, columns: usize },

    #[snafu(display("series values arrived ahead of its columns"))]
    MissingColumns,

    #[snafu(display("decoded frame is inconsistent: {source}"))]
    Frame { source: series_frame::Error },
}

type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// Extract the column names of the first series in `body`.
///
/// Returns an empty vector when the reply carries no series at all (an
/// empty sub-range does this).
pub fn columns(body: &[u8]) -> Result<Vec<String>> {
    let mut de = serde_json::Deserializer::from_slice(body);
    let seed = MemberSeed {
        key: "results",
        seed: Some(FirstElementSeed(Some(MemberSeed {
            key: "series",
            seed: Some(FirstElementSeed(Some(MemberSeed {
                key: "columns",
                seed: Some(PhantomData::<Vec<String>>),
            }))),
        }))),
    };
    let cols = seed.deserialize(&mut de).context(JsonSnafu)?;
    Ok(cols.flatten().flatten().flatten().flatten().unwrap_or_default())
}

/// Decode the single series of `body` into a frame with the given
/// `columns` (the shared set captured from the first reply of the fetch).
pub fn values(body: &[u8], columns: &[String]) -> Result<Series> {
    ensure!(columns.len() >= 2, MissingColumnsSnafu);
    let stride = columns.len() - 1;

    let mut time = Vec::new();
    let mut data = Vec::new();
    let mut fail = None;
    {
        let mut sink = CellSink {
            time: &mut time,
            data: &mut data,
            stride,
            fail: &mut fail,
        };
        let seed = MemberSeed {
            key: "results",
            seed: Some(FirstElementSeed(Some(MemberSeed {
                key: "series",
                seed: Some(FirstElementSeed(Some(MemberSeed {
                    key: "values",
                    seed: Some(RowsSeed { sink: &mut sink }),
                }))),
            }))),
        };
        let mut de = serde_json::Deserializer::from_slice(body);
        let res = seed.deserialize(&mut de);
        if let Some(e) = fail.take() {
            return Err(e);
        }
        res.context(JsonSnafu)?;
    }

    finish_frame(columns.to_vec(), time, data)
}

/// Decode every series of `body`, keeping each one's `name`, `tags` and own
/// column set. Used for tag-grouped fetches.
pub fn tagged_series(body: &[u8]) -> Result<Vec<Series>> {
    let mut out = Vec::new();
    let mut fail = None;
    {
        let seed = MemberSeed {
            key: "results",
            seed: Some(FirstElementSeed(Some(MemberSeed {
                key: "series",
                seed: Some(TaggedListSeed {
                    out: &mut out,
                    fail: &mut fail,
                }),
            }))),
        };
        let mut de = serde_json::Deserializer::from_slice(body);
        let res = seed.deserialize(&mut de);
        if let Some(e) = fail.take() {
            return Err(e);
        }
        res.context(JsonSnafu)?;
    }
    Ok(out)
}

/// Assemble and validate a frame from decoded columnar buffers.
fn finish_frame(columns: Vec<String>, time: Vec<i64>, data: Vec<f32>) -> Result<Series> {
    let stride = columns.len() - 1;
    ensure!(
        data.len() % stride == 0,
        RaggedRowsSnafu {
            data_len: data.len(),
            columns: columns.len(),
        }
    );
    let num = data.len() / stride;

    let fr = Series {
        columns,
        num,
        data_stride: stride,
        data,
        time,
        ..Default::default()
    };
    fr.check_num().context(FrameSnafu)?;
    Ok(fr)
}

/// Where decoded cells land: the frame's columnar buffers plus the error
/// side channel (serde errors are stringly; the original kind is kept here).
struct CellSink<'s> {
    time: &'s mut Vec<i64>,
    data: &'s mut Vec<f32>,
    stride: usize,
    fail: &'s mut Option<DecodeError>,
}

/// One cell of one row: column 0 is the integer timestamp, the rest are
/// numeric values. Null means "no value": NaN while no full row exists yet,
/// afterwards a repeat of the previous row's cell (the backend has already
/// applied its own fill directive at that point, this keeps the frame
/// consistent with it).
struct CellSeed<'a, 's> {
    sink: &'a mut CellSink<'s>,
    col: usize,
}

impl<'a, 's> CellSeed<'a, 's> {
    fn fail<T, E: de::Error>(self, kind: &'static str) -> Result<T, E> {
        *self.sink.fail = Some(DecodeError::UnexpectedType {
            kind,
            col: self.col,
        });
        Err(E::custom("unexpected cell type"))
    }
}

impl<'de> DeserializeSeed<'de> for CellSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for CellSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a numeric cell or null")
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<(), E> {
        if self.col == 0 {
            self.sink.time.push(u as i64);
        } else {
            self.sink.data.push(u as f32);
        }
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, d: f64) -> Result<(), E> {
        if self.col == 0 {
            return self.fail("double");
        }
        self.sink.data.push(d as f32);
        Ok(())
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
        self.fail("int")
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        if self.col == 0 {
            return self.fail("null");
        }
        let data = &mut *self.sink.data;
        let cell = if data.len() < self.sink.stride {
            f32::NAN
        } else {
            data[data.len() - self.sink.stride]
        };
        data.push(cell);
        Ok(())
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
        self.fail("bool")
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
        self.fail("string")
    }
}

/// One row: an array of cells.
struct RowSeed<'a, 's> {
    sink: &'a mut CellSink<'s>,
}

impl<'de> DeserializeSeed<'de> for RowSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RowSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a row array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let mut col = 0;
        while seq
            .next_element_seed(CellSeed {
                sink: &mut *self.sink,
                col,
            })?
            .is_some()
        {
            col += 1;
        }
        Ok(())
    }
}

/// The `values` member: an array of rows.
struct RowsSeed<'a, 's> {
    sink: &'a mut CellSink<'s>,
}

impl<'de> DeserializeSeed<'de> for RowsSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RowsSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of rows")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq
            .next_element_seed(RowSeed {
                sink: &mut *self.sink,
            })?
            .is_some()
        {}
        Ok(())
    }
}

/// Object combinator: applies the inner seed to the value of `key`,
/// skipping every other member.
struct MemberSeed<S> {
    key: &'static str,
    seed: Option<S>,
}

impl<'de, S: DeserializeSeed<'de>> DeserializeSeed<'de> for MemberSeed<S> {
    type Value = Option<S::Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, S: DeserializeSeed<'de>> Visitor<'de> for MemberSeed<S> {
    type Value = Option<S::Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an object with a `{}` member", self.key)
    }

    fn visit_map<A: MapAccess<'de>>(mut self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut out = None;
        while let Some(key) = map.next_key::<String>()? {
            match self.seed.take() {
                Some(seed) if key == self.key => out = Some(map.next_value_seed(seed)?),
                other => {
                    self.seed = other;
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(out)
    }
}

/// Array combinator: applies the inner seed to the first element, skipping
/// the rest.
struct FirstElementSeed<S>(Option<S>);

impl<'de, S: DeserializeSeed<'de>> DeserializeSeed<'de> for FirstElementSeed<S> {
    type Value = Option<S::Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, S: DeserializeSeed<'de>> Visitor<'de> for FirstElementSeed<S> {
    type Value = Option<S::Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a non-empty array")
    }

    fn visit_seq<A: SeqAccess<'de>>(mut self, mut seq: A) -> Result<Self::Value, A::Error> {
        let out = match self.0.take() {
            Some(seed) => seq.next_element_seed(seed)?,
            None => None,
        };
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(out)
    }
}

/// The `series` member of a grouped reply: every element becomes its own
/// [`Series`] with name, tags and columns.
struct TaggedListSeed<'a> {
    out: &'a mut Vec<Series>,
    fail: &'a mut Option<DecodeError>,
}

impl<'de> DeserializeSeed<'de> for TaggedListSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for TaggedListSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of series objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(series) = seq.next_element_seed(TaggedSeriesSeed {
            fail: &mut *self.fail,
        })? {
            self.out.push(series);
        }
        Ok(())
    }
}

/// One series object of a grouped reply.
struct TaggedSeriesSeed<'a> {
    fail: &'a mut Option<DecodeError>,
}

impl<'de> DeserializeSeed<'de> for TaggedSeriesSeed<'_> {
    type Value = Series;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Series, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TaggedSeriesSeed<'_> {
    type Value = Series;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a series object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Series, A::Error> {
        let mut name = String::new();
        let mut tags = HashMap::new();
        let mut columns: Vec<String> = Vec::new();
        let mut time = Vec::new();
        let mut data = Vec::new();

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "name" => name = map.next_value()?,
                "tags" => tags = map.next_value()?,
                "columns" => columns = map.next_value()?,
                "values" => {
                    if columns.len() < 2 {
                        *self.fail = Some(DecodeError::MissingColumns);
                        return Err(de::Error::custom("series values ahead of columns"));
                    }
                    let mut sink = CellSink {
                        time: &mut time,
                        data: &mut data,
                        stride: columns.len() - 1,
                        fail: &mut *self.fail,
                    };
                    map.next_value_seed(RowsSeed { sink: &mut sink })?;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        if columns.len() < 2 {
            // no value columns, so no rows either; merge drops the frame
            return Ok(Series {
                name,
                tags,
                columns,
                ..Default::default()
            });
        }

        match finish_frame(columns, time, data) {
            Ok(mut fr) => {
                fr.name = name;
                fr.tags = tags;
                Ok(fr)
            }
            Err(e) => {
                *self.fail = Some(e);
                Err(de::Error::custom("inconsistent series"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{"results":[{"statement_id":0,"series":[{"name":"load",
        "columns":["time","v"],
        "values":[[1529425346000,null],[1529425347000,null],[1529425348000,0.23],
                  [1529425349000,0.26],[1529425350000,0.21]]}]}]}"#;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn columns_of_first_series() {
        assert_eq!(columns(BODY.as_bytes()).unwrap(), cols(&["time", "v"]));
    }

    #[test]
    fn columns_of_empty_reply() {
        assert!(columns(br#"{"results":[{"statement_id":0}]}"#).unwrap().is_empty());
    }

    #[test]
    fn values_builds_the_frame() {
        let fr = values(BODY.as_bytes(), &cols(&["time", "v"])).unwrap();
        assert_eq!(fr.num, 5);
        assert_eq!(fr.data_stride, 1);
        assert_eq!(fr.time[0], 1529425346000);
        assert_eq!(fr.time[4], 1529425350000);

        // first-row null is NaN, second repeats it
        assert!(fr.data[0].is_nan());
        assert!(fr.data[1].is_nan());
        assert!((fr.data[2] - 0.23).abs() < 1e-7);
        fr.check_num().unwrap();
    }

    #[test]
    fn null_repeats_previous_row_cell() {
        let body = br#"{"results":[{"series":[{"columns":["time","a","b"],
            "values":[[1000,1.5,2],[2000,null,null],[3000,4,null]]}]}]}"#;
        let fr = values(body, &cols(&["time", "a", "b"])).unwrap();
        assert_eq!(fr.data, vec![1.5, 2.0, 1.5, 2.0, 4.0, 2.0]);
    }

    #[test]
    fn values_of_empty_reply_is_an_empty_frame() {
        let fr = values(
            br#"{"results":[{"statement_id":0}]}"#,
            &cols(&["time", "v"]),
        )
        .unwrap();
        assert_eq!(fr.num, 0);
        assert_eq!(fr.columns, cols(&["time", "v"]));
    }

    #[test]
    fn rejects_string_cell() {
        let body = br#"{"results":[{"series":[{"columns":["time","v"],
            "values":[[1000,"oops"]]}]}]}"#;
        assert!(matches!(
            values(body, &cols(&["time", "v"])).unwrap_err(),
            DecodeError::UnexpectedType { kind: "string", col: 1 }
        ));
    }

    #[test]
    fn rejects_null_timestamp() {
        let body = br#"{"results":[{"series":[{"columns":["time","v"],
            "values":[[null,1.0]]}]}]}"#;
        assert!(matches!(
            values(body, &cols(&["time", "v"])).unwrap_err(),
            DecodeError::UnexpectedType { kind: "null", col: 0 }
        ));
    }

    #[test]
    fn rejects_float_timestamp() {
        let body = br#"{"results":[{"series":[{"columns":["time","v"],
            "values":[[1000.5,1.0]]}]}]}"#;
        assert!(matches!(
            values(body, &cols(&["time", "v"])).unwrap_err(),
            DecodeError::UnexpectedType { kind: "double", col: 0 }
        ));
    }

    #[test]
    fn rejects_negative_integer_cell() {
        let body = br#"{"results":[{"series":[{"columns":["time","v"],
            "values":[[1000,-3]]}]}]}"#;
        assert!(matches!(
            values(body, &cols(&["time", "v"])).unwrap_err(),
            DecodeError::UnexpectedType { kind: "int", col: 1 }
        ));
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            values(b"<html>busy</html>", &cols(&["time", "v"])).unwrap_err(),
            DecodeError::Json { .. }
        ));
    }

    #[test]
    fn tagged_series_keeps_tags_and_name() {
        let body = br#"{"results":[{"series":[
            {"name":"load","tags":{"host":"s01"},"columns":["time","v"],
             "values":[[1000,1.0],[2000,2.0]]},
            {"name":"load","tags":{"host":"s02"},"columns":["time","v"],
             "values":[[1000,3.0]]}]}]}"#;

        let all = tagged_series(body).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "load");
        assert_eq!(all[0].tags["host"], "s01");
        assert_eq!(all[0].num, 2);
        assert_eq!(all[1].tags["host"], "s02");
        assert_eq!(all[1].data, vec![3.0]);
        for s in &all {
            s.check_num().unwrap();
        }
    }

    #[test]
    fn tagged_series_of_empty_reply() {
        assert!(tagged_series(br#"{"results":[{}]}"#).unwrap().is_empty());
    }
}
