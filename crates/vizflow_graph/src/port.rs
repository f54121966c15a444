// SPDX-License-Identifier: MIT OR Apache-2.0
//! Port definitions for node inputs/outputs.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Group every port belongs to unless told otherwise
pub const DEFAULT_PORT_GROUP: &str = "default";

/// Identity of a port inside a graph: owning node plus the port's local name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRef {
    /// Owning node
    pub node: NodeId,
    /// Port name, unique within the node
    pub port: String,
}

impl PortRef {
    /// Create a new port reference
    pub fn new(node: impl Into<NodeId>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    /// Input port
    Input,
    /// Output port
    Output,
}

/// Data type that can flow through ports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    /// Volumetric data
    Volume,
    /// Mesh geometry
    Mesh,
    /// Rendered image (color, depth and picking layers)
    Image,
    /// Raw buffer
    Buffer,
    /// Tabular data
    DataFrame,
    /// Boolean value
    Bool,
    /// Integer value
    Int,
    /// Floating point value
    Float,
    /// 3D vector
    Vector3,
    /// 4D vector
    Vector4,
    /// Color (RGBA)
    Color,
    /// String value
    String,
    /// Any type (for generic nodes)
    Any,
    /// Custom type, compatible only with itself unless a rule says otherwise
    Custom(String),
}

impl PortType {
    /// Check if data of this type can flow into a port of another type
    pub fn can_connect_to(&self, other: &PortType) -> bool {
        if matches!(self, Self::Any) || matches!(other, Self::Any) {
            return true;
        }

        if self == other {
            return true;
        }

        match (self, other) {
            (Self::Int, Self::Float) => true,
            (Self::Float, Self::Vector3 | Self::Vector4) => true,
            (Self::Vector3, Self::Vector4) => true,
            (Self::Color, Self::Vector4) | (Self::Vector4, Self::Color) => true,
            _ => false,
        }
    }
}

/// Extra type conversions registered by the application.
///
/// The built-in rules of [`PortType::can_connect_to`] always apply; rules added
/// here widen them, for example to let a module declare that its custom volume
/// format may feed any `Volume` input.
#[derive(Debug, Clone, Default)]
pub struct TypeRules {
    allowed: HashSet<(PortType, PortType)>,
}

impl TypeRules {
    /// Create an empty rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow data of type `from` to flow into ports of type `to`
    pub fn allow(&mut self, from: PortType, to: PortType) {
        self.allowed.insert((from, to));
    }

    /// Check compatibility under built-in and registered rules
    pub fn compatible(&self, from: &PortType, to: &PortType) -> bool {
        from.can_connect_to(to) || self.allowed.contains(&(from.clone(), to.clone()))
    }
}

/// Opaque payload stored on an output port.
///
/// The core never inspects it; consumers downcast to the concrete type.
#[derive(Clone)]
pub struct PortData {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl PortData {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared value
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Get the value as `T`, if that is what it holds
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Rust type name of the payload
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for PortData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortData")
            .field("type", &self.type_name)
            .finish()
    }
}

/// A port on a node
#[derive(Debug, Clone)]
pub struct Port {
    /// Port name, unique within its node
    pub name: String,
    /// Help text shown in the UI
    pub help: String,
    /// Port direction
    pub direction: PortDirection,
    /// Data type
    pub port_type: PortType,
    /// Port group, used to scope resize events
    pub group: String,
    /// Whether an unconnected input still lets the node run
    pub optional: bool,
    /// Whether multiple connections are allowed
    pub multi_connect: bool,
    owner: Option<NodeId>,
    data: Option<PortData>,
}

impl Port {
    /// Create a new port
    pub fn new(name: impl Into<String>, port_type: PortType, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            help: String::new(),
            direction,
            port_type,
            group: DEFAULT_PORT_GROUP.to_string(),
            optional: false,
            multi_connect: direction == PortDirection::Output,
            owner: None,
            data: None,
        }
    }

    /// Create a new single-connection input port
    pub fn input(name: impl Into<String>, port_type: PortType) -> Self {
        Self::new(name, port_type, PortDirection::Input)
    }

    /// Create a new output port
    pub fn output(name: impl Into<String>, port_type: PortType) -> Self {
        Self::new(name, port_type, PortDirection::Output)
    }

    /// Set the help text
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Set the port group
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Mark an input as optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Accept a vector of connections on an input
    pub fn multi(mut self) -> Self {
        self.multi_connect = true;
        self
    }

    /// Whether this is an input port
    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    /// Whether this is an output port
    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }

    /// Node that owns this port, once the node is built
    pub fn owner(&self) -> Option<&NodeId> {
        self.owner.as_ref()
    }

    pub(crate) fn set_owner(&mut self, owner: NodeId) {
        self.owner = Some(owner);
    }

    /// Data currently held by an output port
    pub fn data(&self) -> Option<&PortData> {
        self.data.as_ref()
    }

    /// Replace the data held by an output port
    pub fn set_data(&mut self, data: Option<PortData>) {
        self.data = data;
    }

    /// Check if a connection from this port into `other` is valid
    pub fn can_connect(&self, other: &Port, rules: &TypeRules) -> bool {
        if self.direction != PortDirection::Output || other.direction != PortDirection::Input {
            return false;
        }

        rules.compatible(&self.port_type, &other.port_type)
    }
}
