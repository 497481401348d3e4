//! Sharedraw Core Library
//!
//! Scene model, spatial index, command log and sync protocol for a 2D
//! drawing surface shared by several editors.

pub mod camera;
pub mod collaboration;
pub mod command;
pub mod config;
pub mod geometry;
pub mod render;
pub mod scene;
pub mod session;
pub mod shapes;
pub mod spatial;
pub mod sync;
pub mod transport;

pub use camera::Camera;
pub use collaboration::{CollaborationManager, RemoteUser};
pub use command::{Command, CommandError, CommandManager, CommandResult};
pub use config::EditorConfig;
pub use geometry::{Aabb, GeometryError, GeometryResult};
pub use render::{FrameStats, Painter, RenderContext, RenderLoop};
pub use scene::{Placement, Scene, SceneError, SceneResult};
pub use session::{EditorSession, Origin};
pub use shapes::{Shape, ShapeError, ShapeId, ShapeKind, ShapeSnapshot};
pub use spatial::SpatialIndex;
pub use sync::{CommandPayload, ConnectionState, Envelope, MessageType, SyncError, SyncEvent};
pub use transport::{NativeWebSocket, TransportError, TransportEvent};
