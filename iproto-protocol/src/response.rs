//! Decoded responses.

use crate::error::{ProtocolError, ServerError};
use crate::frame::Frame;
use crate::keys::{body, code};
use crate::value;
use rmpv::Value;

/// One row: an ordered sequence of untyped values.
pub type Tuple = Vec<Value>;

/// Outcome carried by a response. Exactly one side is ever populated.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data(Vec<Tuple>),
    Error(ServerError),
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub sync: u32,
    pub schema_version: Option<u64>,
    pub payload: Payload,
}

impl Response {
    pub fn ok(sync: u32, data: Vec<Tuple>) -> Self {
        Self {
            sync,
            schema_version: None,
            payload: Payload::Data(data),
        }
    }

    pub fn error(sync: u32, error: ServerError) -> Self {
        Self {
            sync,
            schema_version: None,
            payload: Payload::Error(error),
        }
    }

    /// Decodes a response from a frame read off the wire.
    ///
    /// Error frames carry `{ERROR: message}`; success frames carry
    /// `{DATA: [tuple, ...]}` or no data at all (e.g. `PING`).
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let map = frame.body_map()?;
        let payload = match frame.header.error_code() {
            Some(errcode) => {
                let message = value::opt_str(&map, body::ERROR)?.unwrap_or_default();
                Payload::Error(ServerError::new(errcode, message))
            }
            None => {
                let rows = value::array_or_empty(&map, body::DATA)?;
                let data = rows
                    .iter()
                    .map(|row| match row {
                        Value::Array(fields) => fields.clone(),
                        // Scalar results (e.g. from CALL) come back as bare values.
                        other => vec![other.clone()],
                    })
                    .collect();
                Payload::Data(data)
            }
        };
        Ok(Self {
            sync: frame.header.sync,
            schema_version: frame.header.schema_version,
            payload,
        })
    }

    /// Builds the frame a server would send for this response.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let mut frame = Frame::new();
        let body = match &self.payload {
            Payload::Data(rows) => {
                frame.header.code = code::OK;
                value::map_value(vec![(
                    body::DATA,
                    Value::Array(rows.iter().cloned().map(Value::Array).collect()),
                )])
            }
            Payload::Error(err) => {
                frame.header.code = code::ERROR_FLAG | err.code;
                value::map_value(vec![(body::ERROR, Value::from(err.message.as_str()))])
            }
        };
        frame.header.sync = self.sync;
        frame.header.schema_version = self.schema_version;
        frame.set_body_value(&body)?;
        Ok(frame)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, Payload::Error(_))
    }

    /// Converts into the rows, or the server error.
    pub fn into_result(self) -> Result<Vec<Tuple>, ServerError> {
        match self.payload {
            Payload::Data(rows) => Ok(rows),
            Payload::Error(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn through_wire(response: &Response) -> Response {
        let mut out = BytesMut::new();
        response.to_frame().unwrap().write_to(&mut out).unwrap();
        let frame = Frame::decode(&out[crate::frame::LENGTH_PREFIX_SIZE..]).unwrap();
        Response::from_frame(&frame).unwrap()
    }

    #[test]
    fn test_data_response() {
        let response = Response::ok(
            3,
            vec![
                vec![Value::from(1u64), Value::from("a")],
                vec![Value::from(2u64), Value::Nil],
            ],
        );
        let decoded = through_wire(&response);
        assert_eq!(decoded, response);
        assert_eq!(decoded.into_result().unwrap().len(), 2);
    }

    #[test]
    fn test_error_response() {
        let response = Response::error(4, ServerError::new(3, "Duplicate key exists"));
        let decoded = through_wire(&response);
        assert!(decoded.is_error());
        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.code, 3);
        assert_eq!(err.message, "Duplicate key exists");
    }

    #[test]
    fn test_empty_body_is_empty_data() {
        let mut frame = Frame::new();
        frame.header.sync = 1;
        let mut out = BytesMut::new();
        frame.write_to(&mut out).unwrap();
        let frame = Frame::decode(&out[crate::frame::LENGTH_PREFIX_SIZE..]).unwrap();
        let response = Response::from_frame(&frame).unwrap();
        assert_eq!(response.payload, Payload::Data(vec![]));
    }

    #[test]
    fn test_scalar_rows_are_wrapped() {
        let mut frame = Frame::new();
        frame
            .set_body_value(&value::map_value(vec![(
                body::DATA,
                Value::Array(vec![Value::from(42u64)]),
            )]))
            .unwrap();
        let response = Response::from_frame(&frame).unwrap();
        assert_eq!(
            response.into_result().unwrap(),
            vec![vec![Value::from(42u64)]]
        );
    }
}
