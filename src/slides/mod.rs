//! 幻灯片文档模型：分页与演讲者备注
//!
//! 文档以独占一行的 `---` 分隔为若干片段（Fragment），每个片段再按行拆成两个通道：
//! - **visible**：观众可见（标题行、图片/嵌入行、围栏代码块、Tab 或 N 个空格缩进的行）
//! - **notes**：演讲者备注（其余非空行）
//!
//! 纯函数，不依赖任何外部状态；服务端与客户端渲染共用同一套规则。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 片段分隔行
pub const SLIDE_DELIMITER: &str = "---";

/// 视为「可见」的最少前导空格数
pub const DEFAULT_VISIBLE_INDENT: usize = 4;

/// 找不到一级标题时的默认标题
pub const UNTITLED_PRESENTATION: &str = "Untitled Presentation";

/// 图片 / 嵌入行前缀（去掉前导空白后匹配）
const EMBED_PREFIXES: &[&str] = &["![", "<img", "<iframe", "<video", "<audio", "<embed"];

const FENCE_MARKERS: &[&str] = &["```", "~~~"];

/// 单页解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedSlide {
    pub visible: String,
    pub notes: String,
}

impl ParsedSlide {
    /// 把 visible 通道还原成源文本：标题与嵌入行原样输出，其余非空行补一个 Tab 缩进。
    ///
    /// 对结果重新分类，visible 不变且 notes 为空。
    pub fn audience_source(&self) -> String {
        self.visible
            .split('\n')
            .map(|line| {
                let trimmed = line.trim_start();
                if line.is_empty() || trimmed.starts_with('#') || is_embed(trimmed) {
                    line.to_string()
                } else {
                    format!("\t{}", line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end_matches('\r') == SLIDE_DELIMITER
}

fn is_embed(trimmed: &str) -> bool {
    EMBED_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

fn fence_marker(trimmed: &str) -> Option<&'static str> {
    FENCE_MARKERS.iter().copied().find(|m| trimmed.starts_with(m))
}

/// 按分隔行切分文档；空白片段被丢弃，片段内容保持原样
pub fn split_slides(content: &str) -> Vec<String> {
    let mut slides = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in content.split('\n') {
        if is_delimiter(line) {
            push_fragment(&mut slides, &current);
            current.clear();
        } else {
            current.push(line);
        }
    }
    push_fragment(&mut slides, &current);
    slides
}

fn push_fragment(slides: &mut Vec<String>, lines: &[&str]) {
    let fragment = lines.join("\n");
    if !fragment.trim().is_empty() {
        slides.push(fragment);
    }
}

/// split_slides 的逆操作
pub fn join_slides<S: AsRef<str>>(slides: &[S]) -> String {
    slides
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(&format!("\n{}\n", SLIDE_DELIMITER))
}

/// 行分类器：决定每一行属于 visible 还是 notes
#[derive(Debug, Clone, Copy)]
pub struct LineClassifier {
    visible_indent: usize,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBLE_INDENT)
    }
}

impl LineClassifier {
    pub fn new(visible_indent: usize) -> Self {
        Self {
            visible_indent: visible_indent.max(1),
        }
    }

    /// 去掉一个 Tab 或 visible_indent 个空格；未缩进返回 None
    fn strip_indent<'a>(&self, line: &'a str) -> Option<&'a str> {
        if let Some(rest) = line.strip_prefix('\t') {
            return Some(rest);
        }
        let spaces = line.len() - line.trim_start_matches(' ').len();
        if spaces >= self.visible_indent {
            Some(&line[self.visible_indent..])
        } else {
            None
        }
    }

    /// 将单个片段拆成 visible / notes
    pub fn classify(&self, fragment: &str) -> ParsedSlide {
        let mut visible: Vec<&str> = Vec::new();
        let mut notes: Vec<&str> = Vec::new();
        // 围栏内只去掉开栏行自身的缩进，代码的相对缩进原样保留
        let mut open_fence: Option<(&'static str, &str)> = None;

        for raw in fragment.split('\n') {
            let line = raw.trim_end_matches('\r');
            if line == SLIDE_DELIMITER {
                continue;
            }
            let trimmed = line.trim_start();

            if let Some((marker, indent)) = open_fence {
                visible.push(line.strip_prefix(indent).unwrap_or(line));
                if trimmed.starts_with(marker) {
                    open_fence = None;
                }
                continue;
            }

            if let Some(marker) = fence_marker(trimmed) {
                let body = self.strip_indent(line).unwrap_or(line);
                open_fence = Some((marker, &line[..line.len() - body.len()]));
                visible.push(body);
            } else if trimmed.starts_with('#') || is_embed(trimmed) {
                visible.push(trimmed);
            } else if trimmed.is_empty() {
                if visible.is_empty() && notes.is_empty() {
                    continue;
                }
                // 空行归入行数较少的通道，相等时归 visible
                if notes.len() < visible.len() {
                    notes.push("");
                } else {
                    visible.push("");
                }
            } else if let Some(rest) = self.strip_indent(line) {
                visible.push(rest);
            } else {
                notes.push(line);
            }
        }

        ParsedSlide {
            visible: visible.join("\n").trim_matches('\n').to_string(),
            notes: notes.join("\n").trim_matches('\n').to_string(),
        }
    }

    /// 整篇文档：切分后逐页分类
    pub fn parse_document(&self, content: &str) -> Vec<ParsedSlide> {
        split_slides(content)
            .iter()
            .map(|fragment| self.classify(fragment))
            .collect()
    }

    /// 仅保留观众可见内容的文档（可被再次解析，结果不含备注）
    pub fn audience_document(&self, content: &str) -> String {
        let slides: Vec<String> = self
            .parse_document(content)
            .iter()
            .map(ParsedSlide::audience_source)
            .filter(|s| !s.trim().is_empty())
            .collect();
        join_slides(&slides)
    }
}

/// 使用默认缩进规则提取演讲者备注
pub fn extract_presenter_notes(slide: &str) -> ParsedSlide {
    LineClassifier::default().classify(slide)
}

/// 第一个一级标题；没有则返回 "Untitled Presentation"
pub fn extract_title(content: &str) -> String {
    static TITLE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = TITLE.get_or_init(|| Regex::new(r"^#\s+(.+)$").ok()) else {
        return UNTITLED_PRESENTATION.to_string();
    };
    content
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .find_map(|line| re.captures(line).map(|c| c[1].trim().to_string()))
        .unwrap_or_else(|| UNTITLED_PRESENTATION.to_string())
}
