use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content kinds synchronized into the target system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Folder,
    Page,
    File,
    Form,
}

impl ObjectType {
    pub const ALL: [ObjectType; 4] = [
        ObjectType::Folder,
        ObjectType::Page,
        ObjectType::File,
        ObjectType::Form,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Folder => "folder",
            ObjectType::Page => "page",
            ObjectType::File => "file",
            ObjectType::Form => "form",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "folder" => Some(ObjectType::Folder),
            "page" => Some(ObjectType::Page),
            "file" => Some(ObjectType::File),
            "form" => Some(ObjectType::Form),
            _ => None,
        }
    }

    /// Suffix appended to the repository's schema prefix.
    pub fn schema_suffix(&self) -> &'static str {
        match self {
            ObjectType::Folder => "folder",
            ObjectType::Page => "content",
            ObjectType::File => "binary_content",
            ObjectType::Form => "form",
        }
    }

    /// Kinds that keep one target item with several language variants for a
    /// single source identity.
    pub fn has_language_variants(&self) -> bool {
        matches!(self, ObjectType::Folder | ObjectType::Form)
    }

    /// Kinds that may hold children in the target system.
    pub fn is_container(&self) -> bool {
        matches!(self, ObjectType::Folder)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a source object: `(objectType, sourceId)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub object_type: ObjectType,
    pub id: i64,
}

impl ObjectKey {
    pub fn new(object_type: ObjectType, id: i64) -> Self {
        Self { object_type, id }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object_type, self.id)
    }
}

/// The facts the identity mapper needs about an object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub key: ObjectKey,
    pub global_id: String,
    /// Global id of the master's content set (pages only).
    #[serde(default)]
    pub content_set: Option<String>,
    /// Set when the object is the root folder of that site.
    #[serde(default)]
    pub root_of_site: Option<i64>,
}

/// Source-side tenant or channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub global_id: String,
    pub hostname: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub path_prefix: String,
    /// Whether the publish directory segment setting is used for paths.
    #[serde(default)]
    pub publish_dir_segment: bool,
    #[serde(default)]
    pub languages: Vec<String>,
    /// Set for channels: the id of the master site.
    #[serde(default)]
    pub master: Option<i64>,
    pub root_folder: i64,
}

impl Site {
    pub fn is_channel(&self) -> bool {
        self.master.is_some()
    }
}

/// Binary payload attached to a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binary {
    pub file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub data: Vec<u8>,
    /// Focal point for images, relative coordinates in `0.0..=1.0`.
    #[serde(default)]
    pub focal_point: Option<(f32, f32)>,
}

/// Source object as far as the engine needs to know it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceObject {
    pub identity: Identity,
    pub name: String,
    pub site_id: i64,
    #[serde(default)]
    pub parent: Option<ObjectKey>,
    #[serde(default)]
    pub language: Option<String>,
    /// Additional target languages rendered for kinds with language variants.
    #[serde(default)]
    pub alternate_languages: Vec<String>,
    #[serde(default)]
    pub binary: Option<Binary>,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl SourceObject {
    pub fn key(&self) -> ObjectKey {
        self.identity.key
    }
}

/// Rendered attribute value produced by the field renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RenderedValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    List(Vec<RenderedValue>),
    Node(Identity),
    Link(LinkValue),
    PageTag {
        page: Option<Identity>,
        tag: Option<String>,
    },
    TemplateTag {
        template: Option<i64>,
        tag: Option<String>,
    },
    OrderedList {
        items: Vec<RenderedValue>,
        ordered: bool,
    },
    Micronode(MicronodeValue),
    Overview(OverviewValue),
}

/// Page link that is either internal (a node) or external (a URL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LinkValue {
    Internal(Identity),
    External(String),
}

/// Instance of a reusable content block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicronodeValue {
    /// Keyword of the content block definition.
    pub construct: String,
    pub fields: BTreeMap<String, RenderedValue>,
}

/// Dynamic listing configuration and its selected items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OverviewValue {
    pub list_type: Option<String>,
    pub select_type: Option<String>,
    pub order_direction: Option<String>,
    pub order_by: Option<String>,
    #[serde(default)]
    pub items: Vec<Identity>,
    /// Originating site id for every entry of `items`.
    #[serde(default)]
    pub item_sites: Vec<i64>,
    pub source: Option<String>,
    #[serde(default)]
    pub recursive: bool,
    pub max_items: Option<i64>,
}

pub type RenderedFields = BTreeMap<String, RenderedValue>;

/// What happened to an object according to the source dirt queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirtAction {
    Create,
    Update,
    Move,
    Delete,
    Remove,
    Offline,
}

impl DirtAction {
    pub fn is_removal(&self) -> bool {
        matches!(self, DirtAction::Delete | DirtAction::Remove | DirtAction::Offline)
    }
}

/// Entry of the source dirt queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirtEntry {
    pub id: i64,
    pub key: ObjectKey,
    pub site_id: i64,
    pub action: DirtAction,
    /// Target uuid recorded when the object was removed on the source side.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// A unit of work scheduled for one publish batch.
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    pub site_id: i64,
    pub object: SourceObject,
    /// Restricts rendering to these attribute names when set.
    pub attributes: Option<Vec<String>>,
    pub language: Option<String>,
    pub rendered: Option<RenderedFields>,
    pub dirt_id: Option<i64>,
}

impl ScheduledUnit {
    pub fn new(site_id: i64, object: SourceObject) -> Self {
        let language = object.language.clone();
        Self {
            site_id,
            object,
            attributes: None,
            language,
            rendered: None,
            dirt_id: None,
        }
    }

    pub fn with_dirt_id(mut self, id: i64) -> Self {
        self.dirt_id = Some(id);
        self
    }

    pub fn reports_to_queue(&self) -> bool {
        self.dirt_id.is_some()
    }
}
