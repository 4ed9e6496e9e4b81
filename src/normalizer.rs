//! 원시 행 변경 알림을 타입이 있는 변경 이벤트로 정규화
//!
//! 컬럼마다 독립적으로 디코딩합니다.
//! - ENUM: 1부터 시작하는 서수 → 라벨 문자열
//! - SET: 비트마스크 → 비트 오름차순 라벨 배열
//! - 그 외: 값 그대로
//!
//! 한 행이라도 디코딩에 실패하면 해당 이벤트는 버리고 에러만 돌려줍니다.
//! UPDATE는 변경 전/후 이미지가 모두 성공해야만 이벤트가 됩니다.

use crate::error::{DecodeError, DecodeReason};
use crate::events::*;
use serde_json::Value;

/// 실패한 컬럼명과 원인
type ColumnFailure = (Option<String>, DecodeReason);

/// 단일 컬럼 값 디코딩
pub fn decode_value(column: &ColumnMetadata, raw: Value) -> Result<Value, DecodeReason> {
    match column.kind {
        ColumnKind::Enum => decode_enum(column.labels.as_deref(), raw),
        ColumnKind::Set => decode_set(column.labels.as_deref(), raw),
        ColumnKind::Plain => Ok(raw),
    }
}

fn decode_enum(labels: Option<&[String]>, raw: Value) -> Result<Value, DecodeReason> {
    let labels = labels.ok_or(DecodeReason::EnumMetadataMissing)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let ordinal = match (raw.as_u64(), raw.as_i64()) {
        (Some(ordinal), _) => ordinal,
        // 음수 서수
        (None, Some(_)) => return Err(DecodeReason::EnumValueOutOfRange),
        (None, None) => return Err(DecodeReason::EnumValueNotInteger),
    };

    if ordinal == 0 || ordinal > labels.len() as u64 {
        return Err(DecodeReason::EnumValueOutOfRange);
    }

    Ok(Value::String(labels[(ordinal - 1) as usize].clone()))
}

fn decode_set(labels: Option<&[String]>, raw: Value) -> Result<Value, DecodeReason> {
    let labels = labels.ok_or(DecodeReason::SetMetadataMissing)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    // 64개 멤버 SET은 최상위 비트 때문에 음수로 올 수 있음
    let mask = match (raw.as_u64(), raw.as_i64()) {
        (Some(mask), _) => mask,
        (None, Some(signed)) => signed as u64,
        (None, None) => return Err(DecodeReason::SetValueNotInteger),
    };

    if labels.len() < 64 && mask >> labels.len() != 0 {
        return Err(DecodeReason::SetValueOutOfRange);
    }

    let members = labels
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1u64 << bit) != 0)
        .map(|(_, label)| Value::String(label.clone()))
        .collect();

    Ok(Value::Array(members))
}

/// 원시 행 하나를 컬럼명 → 값 매핑으로 디코딩
pub fn decode_row(columns: &[ColumnMetadata], row: Vec<Value>) -> Result<RowImage, ColumnFailure> {
    if row.len() != columns.len() {
        return Err((
            None,
            DecodeReason::ColumnCountMismatch {
                values: row.len(),
                columns: columns.len(),
            },
        ));
    }

    let mut image = RowImage::with_capacity(columns.len());
    for (column, raw) in columns.iter().zip(row) {
        let value = decode_value(column, raw).map_err(|reason| (Some(column.name.clone()), reason))?;
        image.insert(column.name.clone(), value);
    }

    Ok(image)
}

/// 원시 알림 하나를 행 단위 변경 이벤트들로 변환
///
/// 결과는 알림 안의 행 순서를 그대로 따릅니다.
pub fn normalize(notification: RowsNotification) -> Vec<Result<ChangeEvent, DecodeError>> {
    let RowsNotification {
        position,
        schema,
        action,
        rows,
    } = notification;
    let columns = &schema.columns;

    let fail = |(column, reason): ColumnFailure| DecodeError {
        position: position.clone(),
        table: schema.table.clone(),
        column,
        reason,
    };
    let event = |change: RowChange| ChangeEvent {
        binlog_position: position.clone(),
        table: schema.table.clone(),
        change,
    };

    match action {
        RowAction::Insert | RowAction::Delete => rows
            .into_iter()
            .map(|row| {
                let image = decode_row(columns, row).map_err(fail)?;
                Ok(event(match action {
                    RowAction::Insert => RowChange::Insert(image),
                    _ => RowChange::Delete(image),
                }))
            })
            .collect(),
        RowAction::Update => {
            let mut results = Vec::with_capacity(rows.len() / 2 + 1);
            let mut images = rows.into_iter();
            while let Some(before) = images.next() {
                let Some(after) = images.next() else {
                    results.push(Err(fail((None, DecodeReason::MissingPostImage))));
                    break;
                };
                let decoded = decode_row(columns, before)
                    .and_then(|old| decode_row(columns, after).map(|new| (old, new)));
                results.push(match decoded {
                    Ok((old, new)) => Ok(event(RowChange::Update { old, new })),
                    Err(failure) => Err(fail(failure)),
                });
            }
            results
        }
    }
}
