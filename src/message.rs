use serde_json::Value;

use crate::detector::Surge;
use crate::model::{EventData, NotificationEvent, NotificationKind, TrackedEntity};

const MAN: u64 = 10_000;
const OKU: u64 = 100_000_000;

/// Format a count with Japanese myriad units, dropping anything below 万.
///
/// `1_000_000` is `100万`, `150_000_000` is `1億5000万`.
pub fn format_count(count: u64) -> String {
    let oku = count / OKU;
    let man = count % OKU / MAN;

    match (oku, man) {
        (0, 0) => count.to_string(),
        (0, man) => format!("{man}万"),
        (oku, 0) => format!("{oku}億"),
        (oku, man) => format!("{oku}億{man}万"),
    }
}

pub fn milestone_event(entity: &TrackedEntity, milestone: u64) -> NotificationEvent {
    let kind = entity.kind.milestone_kind();
    let count = format_count(milestone);
    let name = &entity.name;

    let (title, message) = match kind {
        NotificationKind::SubscriberMilestone => (
            format!("登録者{count}人突破！"),
            format!("{name}のチャンネル登録者数が{count}人を突破しました！"),
        ),
        _ => (
            format!("{count}回再生突破！"),
            format!("「{name}」の再生回数が{count}回を突破しました！"),
        ),
    };

    let mut data = base_data(entity, kind);
    data.insert("milestone".to_string(), milestone.into());

    NotificationEvent::new(
        kind,
        entity.id.clone(),
        entity.kind,
        milestone,
        title,
        message,
        data,
        entity.audience(),
    )
}

/// `day` is the local `YYYYMMDD` the surge was detected on.
pub fn surge_event(entity: &TrackedEntity, surge: Surge, day: u64) -> NotificationEvent {
    let kind = NotificationKind::Surge;
    let name = &entity.name;
    let increase = format_count(surge.increase());
    let percent = surge.percent();

    let title = format!("急上昇中！「{name}」");
    let message = format!("「{name}」の再生回数が24時間で{increase}回増えました（+{percent}%）");

    let mut data = base_data(entity, kind);
    data.insert("previous".to_string(), surge.previous.into());
    data.insert("current".to_string(), surge.current.into());
    data.insert("increase".to_string(), surge.increase().into());

    NotificationEvent::new(
        kind,
        entity.id.clone(),
        entity.kind,
        day,
        title,
        message,
        data,
        entity.audience(),
    )
}

fn base_data(entity: &TrackedEntity, kind: NotificationKind) -> EventData {
    let mut data = EventData::new();
    data.insert("type".to_string(), Value::from(kind.as_str()));
    data.insert("targetId".to_string(), Value::from(entity.id.as_str()));
    data.insert("url".to_string(), Value::from(entity.kind.link(&entity.id)));
    data
}
