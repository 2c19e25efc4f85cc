//! gRPC transport.
//!
//! Methods are resolved at call time through the server's reflection service,
//! so the agent needs no compiled-in descriptors. Request fields are set from
//! rendered strings by field kind; the response is flattened back to strings
//! so the configured `status` and `output` fields can be read by name.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kbagent_proto::{ActionError, GrpcAction, GrpcResponse};
use prost_reflect::prost::Message;
use prost_reflect::prost_types::{FileDescriptorProto, FileDescriptorSet};
use prost_reflect::{
    DescriptorPool, DynamicMessage, Kind, MessageDescriptor, MethodDescriptor, ReflectMessage, Value,
};
use tonic::codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;
use tracing::debug;

use super::{render_template, write_sink, ActionIo};

const DEFAULT_HOST: &str = "127.0.0.1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Scalar message fields, by field name, rendered as strings.
pub type RpcFields = BTreeMap<String, String>;

/// A unary method on a gRPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpcTarget {
    /// `http://host:port`
    pub endpoint: String,
    /// Fully qualified service name.
    pub service: String,
    pub method: String,
}

impl RpcTarget {
    pub fn from_action(spec: &GrpcAction) -> Self {
        let host = if spec.host.is_empty() {
            DEFAULT_HOST
        } else {
            spec.host.as_str()
        };
        Self {
            endpoint: format!("http://{host}:{}", spec.port),
            service: spec.service.clone(),
            method: spec.method.clone(),
        }
    }
}

/// Issues a unary call with string-valued request fields.
#[async_trait]
pub trait RpcInvoker: Send + Sync {
    async fn invoke(&self, target: &RpcTarget, request: RpcFields) -> Result<RpcFields, ActionError>;
}

/// A prepared gRPC action call.
pub(super) struct GrpcCall {
    target: RpcTarget,
    request: RpcFields,
    response: GrpcResponse,
}

impl GrpcCall {
    pub(super) fn new(
        spec: &GrpcAction,
        parameters: &HashMap<String, String>,
    ) -> Result<Self, ActionError> {
        let request = spec
            .request
            .iter()
            .map(|(field, value)| {
                let what = format!("grpc request field {field}");
                Ok((field.clone(), render_template(&what, value, parameters)?))
            })
            .collect::<Result<RpcFields, ActionError>>()?;
        Ok(Self {
            target: RpcTarget::from_action(spec),
            request,
            response: spec.response.clone(),
        })
    }

    /// Invokes the method and interprets the response.
    ///
    /// A non-empty status field fails the call with the output field written
    /// to stderr; otherwise the output field goes to stdout.
    pub(super) async fn run(
        self,
        rpc: Arc<dyn RpcInvoker>,
        mut io: ActionIo,
    ) -> Result<(), ActionError> {
        let reply = rpc.invoke(&self.target, self.request).await?;

        let status = response_field(&reply, &self.response.status)?;
        let output = response_field(&reply, &self.response.output)?;

        if status.is_empty() {
            write_sink(&mut io.stdout, output.as_bytes())
                .await
                .map_err(|e| ActionError::failed(format!("failed to write output: {e}")))?;
            Ok(())
        } else {
            let _ = write_sink(&mut io.stderr, output.as_bytes()).await;
            Err(ActionError::failed(format!("grpc call failed: {status}")))
        }
    }
}

fn response_field(reply: &RpcFields, name: &str) -> Result<String, ActionError> {
    if name.is_empty() {
        return Ok(String::new());
    }
    reply
        .get(name)
        .cloned()
        .ok_or_else(|| ActionError::failed(format!("field {name} not found in grpc response")))
}

// =============================================================================
// Reflection invoker
// =============================================================================

/// [`RpcInvoker`] backed by server reflection.
///
/// Channels and resolved methods are cached per endpoint.
pub struct ReflectionInvoker {
    channels: Mutex<HashMap<String, Channel>>,
    methods: Mutex<HashMap<RpcTarget, MethodDescriptor>>,
}

impl Default for ReflectionInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReflectionInvoker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, endpoint: &str) -> Result<Channel, ActionError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(endpoint) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| ActionError::bad_request(format!("invalid grpc endpoint {endpoint}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();
        channels.insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    async fn method(
        &self,
        target: &RpcTarget,
        channel: Channel,
    ) -> Result<MethodDescriptor, ActionError> {
        if let Some(method) = self
            .methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
        {
            return Ok(method.clone());
        }

        let pool = fetch_descriptors(channel, &target.service).await?;
        let method = find_method(&pool, &target.service, &target.method)?;
        debug!(service = %target.service, method = %target.method, "resolved grpc method");

        self.methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.clone(), method.clone());
        Ok(method)
    }
}

#[async_trait]
impl RpcInvoker for ReflectionInvoker {
    async fn invoke(&self, target: &RpcTarget, request: RpcFields) -> Result<RpcFields, ActionError> {
        let channel = self.channel(&target.endpoint)?;
        let method = self.method(target, channel.clone()).await?;

        let mut message = DynamicMessage::new(method.input());
        for (name, value) in &request {
            set_field(&mut message, name, value)?;
        }

        let path = PathAndQuery::from_str(&format!(
            "/{}/{}",
            method.parent_service().full_name(),
            method.name()
        ))
        .map_err(|e| ActionError::bad_request(format!("invalid grpc method path: {e}")))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| ActionError::internal(format!("grpc service not ready: {e}")))?;
        let response = grpc
            .unary(Request::new(message), path, DynamicCodec::new(method.output()))
            .await
            .map_err(status_error)?;

        Ok(message_fields(&response.into_inner()))
    }
}

async fn fetch_descriptors(channel: Channel, service: &str) -> Result<DescriptorPool, ActionError> {
    let mut client = ServerReflectionClient::new(channel);
    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::FileContainingSymbol(service.to_string())),
    };

    let mut replies = client
        .server_reflection_info(tokio_stream::once(request))
        .await
        .map_err(status_error)?
        .into_inner();
    let reply = replies
        .message()
        .await
        .map_err(status_error)?
        .ok_or_else(|| ActionError::internal("reflection stream closed without a response"))?;

    match reply.message_response {
        Some(MessageResponse::FileDescriptorResponse(files)) => {
            decode_file_descriptors(&files.file_descriptor_proto)
        }
        Some(MessageResponse::ErrorResponse(e)) => Err(ActionError::internal(format!(
            "reflection failed ({}): {}",
            e.error_code, e.error_message
        ))),
        _ => Err(ActionError::internal("unexpected reflection response")),
    }
}

fn decode_file_descriptors(raw: &[Vec<u8>]) -> Result<DescriptorPool, ActionError> {
    let file = raw
        .iter()
        .map(|bytes| FileDescriptorProto::decode(bytes.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ActionError::internal(format!("invalid file descriptor: {e}")))?;

    let mut pool = DescriptorPool::new();
    pool.add_file_descriptor_set(FileDescriptorSet { file })
        .map_err(|e| ActionError::internal(format!("invalid file descriptor: {e}")))?;
    Ok(pool)
}

fn find_method(
    pool: &DescriptorPool,
    service: &str,
    method: &str,
) -> Result<MethodDescriptor, ActionError> {
    pool.get_service_by_name(service)
        .ok_or_else(|| ActionError::bad_request(format!("grpc service not found: {service}")))?
        .methods()
        .find(|candidate| candidate.name() == method)
        .ok_or_else(|| ActionError::bad_request(format!("grpc method not found: {service}.{method}")))
}

fn status_error(status: Status) -> ActionError {
    match status.code() {
        Code::DeadlineExceeded => ActionError::timed_out(),
        Code::Unavailable => ActionError::internal(format!("grpc endpoint unavailable: {}", status.message())),
        Code::Unimplemented => ActionError::not_implemented(status.message().to_string()),
        code => ActionError::failed(format!("grpc request failed ({code:?}): {}", status.message())),
    }
}

// =============================================================================
// Field conversion
// =============================================================================

fn set_field(message: &mut DynamicMessage, name: &str, raw: &str) -> Result<(), ActionError> {
    let field = message
        .descriptor()
        .get_field_by_name(name)
        .ok_or_else(|| ActionError::bad_request(format!("field {name} not found in grpc request")))?;
    if field.is_list() || field.is_map() {
        return Err(ActionError::bad_request(format!("field {name} is not a scalar")));
    }

    let invalid = |e: &dyn std::fmt::Display| {
        ActionError::bad_request(format!("invalid value of field {name}: {e}"))
    };
    let value = match field.kind() {
        Kind::String => Value::String(raw.to_string()),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            Value::I32(raw.parse().map_err(|e| invalid(&e))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(raw.parse().map_err(|e| invalid(&e))?)
        }
        Kind::Uint32 | Kind::Fixed32 => Value::U32(raw.parse().map_err(|e| invalid(&e))?),
        Kind::Uint64 | Kind::Fixed64 => Value::U64(raw.parse().map_err(|e| invalid(&e))?),
        Kind::Bool => Value::Bool(parse_bool(raw).ok_or_else(|| invalid(&raw))?),
        other => {
            return Err(ActionError::bad_request(format!(
                "unsupported type {other:?} of field {name}"
            )))
        }
    };
    message.set_field(&field, value);
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn message_fields(message: &DynamicMessage) -> RpcFields {
    message
        .descriptor()
        .fields()
        .filter(|field| !field.is_list() && !field.is_map())
        .filter_map(|field| {
            let value = message.get_field(&field);
            scalar_string(&value).map(|s| (field.name().to_string(), s))
        })
        .collect()
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::I32(v) => Some(v.to_string()),
        Value::I64(v) => Some(v.to_string()),
        Value::U32(v) => Some(v.to_string()),
        Value::U64(v) => Some(v.to_string()),
        Value::Bool(v) => Some(v.to_string()),
        Value::EnumNumber(v) => Some(v.to_string()),
        _ => None,
    }
}

// =============================================================================
// Dynamic codec
// =============================================================================

#[derive(Clone)]
struct DynamicCodec {
    output: MessageDescriptor,
    buffer_settings: BufferSettings,
}

#[derive(Clone, Default)]
struct DynamicEncoder {
    buffer_settings: BufferSettings,
}

#[derive(Clone)]
struct DynamicDecoder {
    output: MessageDescriptor,
    buffer_settings: BufferSettings,
}

impl DynamicCodec {
    fn new(output: MessageDescriptor) -> Self {
        Self {
            output,
            buffer_settings: BufferSettings::default(),
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder {
            buffer_settings: self.buffer_settings,
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            output: self.output.clone(),
            buffer_settings: self.buffer_settings,
        }
    }
}

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, buf: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(buf)
            .map_err(|err| Status::internal(err.to_string()))
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.buffer_settings
    }
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.output.clone(), buf)
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Some(message))
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.buffer_settings
    }
}
