//! Typed list queries.
//!
//! Filters and sort keys are closed enums mapped onto entity columns, so no
//! caller-supplied text ever reaches the SQL beyond bound values.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Select,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{order, OrderStatus};
use crate::errors::ServiceError;

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Pagination and ordering over any entity select.
pub struct QueryBuilder<E: EntityTrait> {
    query: Select<E>,
    page: u64,
    limit: u64,
}

impl<E: EntityTrait> Default for QueryBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EntityTrait> QueryBuilder<E> {
    pub fn new() -> Self {
        Self {
            query: E::find(),
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }

    /// Pages are 1-based; the limit is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn paginate(mut self, page: u64, limit: u64) -> Self {
        self.page = page.max(1);
        self.limit = limit.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.query = self.query.filter(condition);
        self
    }

    pub fn order_by<C>(mut self, column: C, direction: SortDirection) -> Self
    where
        C: ColumnTrait,
    {
        self.query = match direction {
            SortDirection::Asc => self.query.order_by_asc(column),
            SortDirection::Desc => self.query.order_by_desc(column),
        };
        self
    }

    /// Returns the requested page and the total number of matching rows.
    pub async fn execute<C>(self, db: &C) -> Result<(Vec<E::Model>, u64), sea_orm::DbErr>
    where
        C: ConnectionTrait,
        E::Model: Send + Sync,
    {
        let total = self.query.clone().count(db).await?;
        let items = self
            .query
            .limit(self.limit)
            .offset((self.page - 1) * self.limit)
            .all(db)
            .await?;
        Ok((items, total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(ServiceError::InvalidInput(format!(
                "unknown sort direction '{}'",
                other
            ))),
        }
    }
}

/// Columns orders may be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSortField {
    #[default]
    CreatedAt,
    Total,
    InvoiceNumber,
    Status,
}

impl OrderSortField {
    fn column(self) -> order::Column {
        match self {
            OrderSortField::CreatedAt => order::Column::CreatedAt,
            OrderSortField::Total => order::Column::Total,
            OrderSortField::InvoiceNumber => order::Column::InvoiceNumber,
            OrderSortField::Status => order::Column::Status,
        }
    }
}

impl FromStr for OrderSortField {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "created_at" => Ok(OrderSortField::CreatedAt),
            "total" => Ok(OrderSortField::Total),
            "invoice_number" => Ok(OrderSortField::InvoiceNumber),
            "status" => Ok(OrderSortField::Status),
            other => Err(ServiceError::InvalidInput(format!(
                "cannot sort orders by '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub user_id: Option<Uuid>,
    pub checkout_session_id: Option<Uuid>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl OrderFilter {
    pub fn condition(&self) -> Condition {
        let mut condition = Condition::all();
        if let Some(status) = self.status {
            condition = condition.add(order::Column::Status.eq(status));
        }
        if let Some(user_id) = self.user_id {
            condition = condition.add(order::Column::UserId.eq(user_id));
        }
        if let Some(session_id) = self.checkout_session_id {
            condition = condition.add(order::Column::CheckoutSessionId.eq(session_id));
        }
        if let Some(from) = self.created_from {
            condition = condition.add(order::Column::CreatedAt.gte(from));
        }
        if let Some(to) = self.created_to {
            condition = condition.add(order::Column::CreatedAt.lt(to));
        }
        condition
    }
}

/// Raw list parameters as they arrive on the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderListParams {
    pub status: Option<String>,
    pub user_id: Option<Uuid>,
    pub checkout_session_id: Option<Uuid>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub sort: Option<String>,
    pub direction: Option<String>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

/// A validated order listing request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderQuery {
    pub filter: OrderFilter,
    pub sort: OrderSortField,
    pub direction: SortDirection,
    pub page: u64,
    pub limit: u64,
}

impl Default for OrderQuery {
    fn default() -> Self {
        Self {
            filter: OrderFilter::default(),
            sort: OrderSortField::default(),
            direction: SortDirection::default(),
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl TryFrom<OrderListParams> for OrderQuery {
    type Error = ServiceError;

    fn try_from(params: OrderListParams) -> Result<Self, Self::Error> {
        let status = params
            .status
            .as_deref()
            .map(|s| {
                s.parse::<OrderStatus>()
                    .map_err(|_| ServiceError::InvalidInput(format!("unknown order status '{}'", s)))
            })
            .transpose()?;

        if let (Some(from), Some(to)) = (params.created_from, params.created_to) {
            if from >= to {
                return Err(ServiceError::InvalidInput(
                    "created_from must be before created_to".to_string(),
                ));
            }
        }

        let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ServiceError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        Ok(Self {
            filter: OrderFilter {
                status,
                user_id: params.user_id,
                checkout_session_id: params.checkout_session_id,
                created_from: params.created_from,
                created_to: params.created_to,
            },
            sort: params
                .sort
                .as_deref()
                .map(str::parse::<OrderSortField>)
                .transpose()?
                .unwrap_or_default(),
            direction: params
                .direction
                .as_deref()
                .map(str::parse::<SortDirection>)
                .transpose()?
                .unwrap_or_default(),
            page: params.page.unwrap_or(1).max(1),
            limit,
        })
    }
}

impl OrderQuery {
    /// Builds the paginated select; ties break on the primary key for stable pages.
    pub fn builder(&self) -> QueryBuilder<order::Entity> {
        QueryBuilder::<order::Entity>::new()
            .filter(self.filter.condition())
            .order_by(self.sort.column(), self.direction)
            .order_by(order::Column::Id, SortDirection::Asc)
            .paginate(self.page, self.limit)
    }
}
