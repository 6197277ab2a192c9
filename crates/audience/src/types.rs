//! Typed arguments and results of runtime commands.

use serde::{Deserialize, Serialize};

use crate::channel::protocol::WindowHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screen {
    pub frame: Rect,
    /// Usable area, excluding docks and task bars.
    pub workspace: Rect,
}

/// Result of `screen_list`. Indices are `-1` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenList {
    pub focused: i64,
    pub primary: i64,
    pub screens: Vec<Screen>,
}

impl ScreenList {
    pub fn focused_screen(&self) -> Option<&Screen> {
        usize::try_from(self.focused)
            .ok()
            .and_then(|i| self.screens.get(i))
    }

    pub fn primary_screen(&self) -> Option<&Screen> {
        usize::try_from(self.primary)
            .ok()
            .and_then(|i| self.screens.get(i))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    pub frame: Rect,
    pub workspace: Size,
}

/// Result of `window_list`. `focused` indexes `windows`, `-1` when none has focus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowList {
    pub focused: i64,
    pub windows: Vec<WindowInfo>,
}

impl WindowList {
    pub fn focused_window(&self) -> Option<&WindowInfo> {
        usize::try_from(self.focused)
            .ok()
            .and_then(|i| self.windows.get(i))
    }
}

/// Web application a window should load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebApp {
    /// Local directory served by the runtime.
    Dir(String),
    Url(String),
}

/// Arguments of `window_create`.
///
/// Unset fields are omitted so the runtime applies its defaults
/// (60% of the focused workspace, centered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowDetails {
    #[serde(flatten)]
    pub app: WebApp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resizable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<bool>,
}

impl WindowDetails {
    pub fn dir(dir: impl Into<String>) -> Self {
        Self::new(WebApp::Dir(dir.into()))
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(WebApp::Url(url.into()))
    }

    fn new(app: WebApp) -> Self {
        Self {
            app,
            title: None,
            size: None,
            pos: None,
            decorated: None,
            resizable: None,
            top: None,
            dev: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size = Some([width, height]);
        self
    }

    pub fn with_pos(mut self, x: f64, y: f64) -> Self {
        self.pos = Some([x, y]);
        self
    }

    pub fn with_decorated(mut self, decorated: bool) -> Self {
        self.decorated = Some(decorated);
        self
    }

    pub fn with_resizable(mut self, resizable: bool) -> Self {
        self.resizable = Some(resizable);
        self
    }

    pub fn with_top(mut self, top: bool) -> Self {
        self.top = Some(top);
        self
    }

    pub fn with_dev(mut self, dev: bool) -> Self {
        self.dev = Some(dev);
        self
    }
}
