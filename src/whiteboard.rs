//! Общая доска: локальные штрихи рисуются сразу и рассылаются как `draw`,
//! удалённые применяются без повторной рассылки.

use crate::peer::types::DataMessage;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub from: Point,
    pub to: Point,
    pub color: String,
}

impl Segment {
    pub fn to_message(&self) -> DataMessage {
        DataMessage::Draw {
            from_x: self.from.x,
            from_y: self.from.y,
            to_x: self.to.x,
            to_y: self.to.y,
            color: self.color.clone(),
        }
    }
}

/// Поверхность рисования; сам рендер делает UI
pub trait Canvas: Send {
    fn draw_segment(&mut self, segment: &Segment);
    fn clear(&mut self);
    fn is_empty(&self) -> bool;
}

/// Канва в памяти: хранит отрезки по порядку
#[derive(Debug, Default)]
pub struct StrokeCanvas {
    segments: Vec<Segment>,
}

impl StrokeCanvas {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl Canvas for StrokeCanvas {
    fn draw_segment(&mut self, segment: &Segment) {
        self.segments.push(segment.clone());
    }

    fn clear(&mut self) {
        self.segments.clear();
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

pub struct WhiteboardSync {
    canvas: Box<dyn Canvas>,
    color: String,
    last: Option<Point>,
}

impl WhiteboardSync {
    pub fn new(canvas: Box<dyn Canvas>) -> Self {
        Self {
            canvas,
            color: "#000000".into(),
            last: None,
        }
    }

    pub fn canvas(&self) -> &dyn Canvas {
        self.canvas.as_ref()
    }

    pub fn set_color(&mut self, color: impl Into<String>) {
        self.color = color.into();
    }

    pub fn pointer_down(&mut self, at: Point) {
        self.last = Some(at);
    }

    /// Отрезок от прошлой точки: уже нарисован, вернувшееся сообщение надо разослать
    pub fn pointer_move(&mut self, to: Point) -> Option<DataMessage> {
        let from = self.last?;
        self.last = Some(to);
        let segment = Segment {
            from,
            to,
            color: self.color.clone(),
        };
        self.canvas.draw_segment(&segment);
        Some(segment.to_message())
    }

    pub fn pointer_up(&mut self) {
        self.last = None;
    }

    /// Локальная очистка; сообщение `clear` отправляется всегда, даже для пустой доски
    pub fn clear_local(&mut self) -> DataMessage {
        self.canvas.clear();
        DataMessage::Clear
    }

    /// Удалённый `draw`/`clear`; ничего не рассылает
    pub fn apply_remote(&mut self, msg: &DataMessage) {
        match msg {
            DataMessage::Draw {
                from_x,
                from_y,
                to_x,
                to_y,
                color,
            } => {
                self.canvas.draw_segment(&Segment {
                    from: Point::new(*from_x, *from_y),
                    to: Point::new(*to_x, *to_y),
                    color: color.clone(),
                });
            }
            DataMessage::Clear => self.canvas.clear(),
            other => debug!("Whiteboard ignores {}", other.kind()),
        }
    }

    /// Конец сессии: доска очищается без рассылки
    pub fn reset(&mut self) {
        self.last = None;
        self.canvas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Канва, которую тест может разглядывать после передачи владения
    #[derive(Clone, Default)]
    struct SharedCanvas(Arc<Mutex<StrokeCanvas>>);

    impl Canvas for SharedCanvas {
        fn draw_segment(&mut self, segment: &Segment) {
            self.0.lock().unwrap().draw_segment(segment);
        }
        fn clear(&mut self) {
            self.0.lock().unwrap().clear();
        }
        fn is_empty(&self) -> bool {
            self.0.lock().unwrap().is_empty()
        }
    }

    #[test]
    fn gesture_becomes_segments_drawn_locally() {
        let canvas = SharedCanvas::default();
        let mut board = WhiteboardSync::new(Box::new(canvas.clone()));
        board.set_color("red");

        assert_eq!(board.pointer_move(Point::new(5.0, 5.0)), None);
        board.pointer_down(Point::new(0.0, 0.0));
        let first = board.pointer_move(Point::new(1.0, 1.0)).unwrap();
        let second = board.pointer_move(Point::new(2.0, 3.0)).unwrap();
        board.pointer_up();
        assert_eq!(board.pointer_move(Point::new(9.0, 9.0)), None);

        assert_eq!(
            first,
            DataMessage::Draw {
                from_x: 0.0,
                from_y: 0.0,
                to_x: 1.0,
                to_y: 1.0,
                color: "red".into()
            }
        );
        assert!(matches!(second, DataMessage::Draw { from_x, to_y, .. } if from_x == 1.0 && to_y == 3.0));
        assert_eq!(canvas.0.lock().unwrap().segments().len(), 2);
    }

    #[test]
    fn clearing_empty_board_still_emits_clear() {
        let mut board = WhiteboardSync::new(Box::<StrokeCanvas>::default());
        assert!(board.canvas().is_empty());
        assert_eq!(board.clear_local(), DataMessage::Clear);
        assert!(board.canvas().is_empty());
        assert_eq!(board.clear_local(), DataMessage::Clear);
    }

    #[test]
    fn remote_draw_and_clear_apply_in_order() {
        let canvas = SharedCanvas::default();
        let mut board = WhiteboardSync::new(Box::new(canvas.clone()));
        let draw = Segment {
            from: Point::new(0.0, 0.0),
            to: Point::new(4.0, 4.0),
            color: "blue".into(),
        }
        .to_message();
        board.apply_remote(&draw);
        assert_eq!(canvas.0.lock().unwrap().segments()[0].color, "blue");
        board.apply_remote(&DataMessage::Clear);
        board.apply_remote(&DataMessage::Clear);
        assert!(canvas.0.lock().unwrap().is_empty());
    }
}
