//! Event-driven, forward-only scan over one large legacy document.
//!
//! The document is a single JSON object whose top-level keys are sections.
//! Small sections are handed to the sink as whole values; sections named in
//! the streamed list are delivered element-by-element with an end signal,
//! without the array ever being materialized. One forward pass; callback
//! order matches document order.

use std::fmt;
use std::io::{BufReader, Read};

use serde::de::{DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::Value;

use crate::ImportError;

/// Consumer of a document scan.
///
/// `on_section_value` fires once per non-streamed section with its whole
/// value; `on_section_element` fires per element of a streamed section,
/// followed by exactly one `on_section_end` for that section.
pub trait SectionSink {
    /// A non-streamed section arrived as one value.
    ///
    /// # Errors
    /// A returned error aborts the scan and becomes the run error.
    fn on_section_value(&mut self, section: &str, value: Value) -> Result<(), ImportError>;

    /// One element of a streamed section arrived.
    ///
    /// # Errors
    /// A returned error aborts the scan and becomes the run error.
    fn on_section_element(&mut self, section: &str, element: Value) -> Result<(), ImportError>;

    /// A streamed section's array has ended.
    ///
    /// # Errors
    /// A returned error aborts the scan and becomes the run error.
    fn on_section_end(&mut self, section: &str) -> Result<(), ImportError>;
}

/// Scan a legacy document, dispatching sections to `sink`.
///
/// # Errors
/// Returns `ImportError::MalformedDocument` for syntax errors — fatal for
/// the whole run — or the first error a sink callback returned.
pub fn scan_document<R: Read, S: SectionSink>(
    reader: R,
    streamed: &[&str],
    sink: &mut S,
) -> Result<(), ImportError> {
    let mut state = ScanState { streamed, sink, failure: None };
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(reader));
    let outcome = RootSeed { state: &mut state }.deserialize(&mut deserializer);
    match outcome {
        Ok(()) => deserializer
            .end()
            .map_err(|err| ImportError::MalformedDocument(err.to_string())),
        Err(err) => Err(state
            .failure
            .take()
            .unwrap_or_else(|| ImportError::MalformedDocument(err.to_string()))),
    }
}

struct ScanState<'s, S: SectionSink> {
    streamed: &'s [&'s str],
    sink: &'s mut S,
    failure: Option<ImportError>,
}

impl<S: SectionSink> ScanState<'_, S> {
    /// Run a sink callback, stashing its error so the scan can abort through
    /// serde's error channel without losing the original failure.
    fn dispatch<E: serde::de::Error>(
        &mut self,
        call: impl FnOnce(&mut S) -> Result<(), ImportError>,
    ) -> Result<(), E> {
        match call(self.sink) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.failure = Some(err);
                Err(E::custom("section sink failed"))
            }
        }
    }
}

struct RootSeed<'a, 's, S: SectionSink> {
    state: &'a mut ScanState<'s, S>,
}

impl<'de, S: SectionSink> DeserializeSeed<'de> for RootSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, S: SectionSink> Visitor<'de> for RootSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a top-level archive document object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(section) = map.next_key::<String>()? {
            if self.state.streamed.contains(&section.as_str()) {
                map.next_value_seed(SectionSeed { state: &mut *self.state, section: &section })?;
                self.state.dispatch(|sink| sink.on_section_end(&section))?;
            } else {
                let value: Value = map.next_value()?;
                self.state.dispatch(|sink| sink.on_section_value(&section, value))?;
            }
        }
        Ok(())
    }
}

struct SectionSeed<'a, 's, 'n, S: SectionSink> {
    state: &'a mut ScanState<'s, S>,
    section: &'n str,
}

impl<'de, S: SectionSink> DeserializeSeed<'de> for SectionSeed<'_, '_, '_, S> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, S: SectionSink> Visitor<'de> for SectionSeed<'_, '_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array for streamed section `{}`", self.section)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(element) = seq.next_element::<Value>()? {
            self.state.dispatch(|sink| sink.on_section_element(self.section, element))?;
        }
        Ok(())
    }
}
