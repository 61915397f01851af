//! Pure analytics over menu events: per-product counters, top rankings,
//! and the rendered context block fed into the model prompt. No I/O.

use std::collections::HashMap;

use forno_contracts::{EventAction, MenuEvent};

pub const TOP_VIEWED_LIMIT: usize = 10;
pub const TOP_PURCHASED_LIMIT: usize = 5;

/// Per-product counters accumulated from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductStats {
    pub product_id: String,
    pub name: String,
    pub views: u64,
    pub added_to_cart: u64,
    pub purchased: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub views: u64,
    pub added_to_cart: u64,
    pub purchased: u64,
}

/// Aggregation result. Products are kept in first-encounter order so the
/// rankings break ties deterministically.
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: usize,
    products: Vec<ProductStats>,
}

impl EventStats {
    /// Folds the event list into per-product counters. Events without a
    /// product payload still count toward `total_events`; unrecognized
    /// actions increment nothing. Sums are commutative, so the result
    /// does not depend on event order beyond tie-breaking.
    pub fn aggregate(events: &[MenuEvent]) -> Self {
        let mut stats = Self {
            total_events: events.len(),
            products: Vec::new(),
        };
        let mut index: HashMap<String, usize> = HashMap::new();

        for event in events {
            let Some(data) = &event.data else { continue };
            let Some(product) = &data.product else { continue };

            let slot = *index.entry(product.id.clone()).or_insert_with(|| {
                stats.products.push(ProductStats {
                    product_id: product.id.clone(),
                    name: product.name.clone(),
                    views: 0,
                    added_to_cart: 0,
                    purchased: 0,
                    removed: 0,
                });
                stats.products.len() - 1
            });

            let entry = &mut stats.products[slot];
            match data.action {
                Some(EventAction::View) => entry.views += 1,
                Some(EventAction::AddToCart) => entry.added_to_cart += 1,
                Some(EventAction::Purchase) => entry.purchased += 1,
                Some(EventAction::RemoveFromCart) => entry.removed += 1,
                Some(EventAction::Unknown) | None => {}
            }
        }
        stats
    }

    pub fn products(&self) -> &[ProductStats] {
        &self.products
    }

    /// Products by descending view count, ties in encounter order, top 10.
    pub fn top_viewed(&self) -> Vec<&ProductStats> {
        let mut ranked: Vec<&ProductStats> = self.products.iter().collect();
        ranked.sort_by(|a, b| b.views.cmp(&a.views));
        ranked.truncate(TOP_VIEWED_LIMIT);
        ranked
    }

    /// Purchased products by descending purchase count, top 5.
    pub fn top_purchased(&self) -> Vec<&ProductStats> {
        let mut ranked: Vec<&ProductStats> =
            self.products.iter().filter(|s| s.purchased > 0).collect();
        ranked.sort_by(|a, b| b.purchased.cmp(&a.purchased));
        ranked.truncate(TOP_PURCHASED_LIMIT);
        ranked
    }

    pub fn totals(&self) -> Totals {
        self.products.iter().fold(Totals::default(), |acc, s| Totals {
            views: acc.views + s.views,
            added_to_cart: acc.added_to_cart + s.added_to_cart,
            purchased: acc.purchased + s.purchased,
        })
    }

    /// `None` when there are no views, guarding the division.
    pub fn conversion_rate(&self) -> Option<f64> {
        let totals = self.totals();
        if totals.views == 0 {
            return None;
        }
        Some(totals.purchased as f64 / totals.views as f64 * 100.0)
    }
}

/// Renders the aggregation into the plain-text context block. Sections
/// with no content are omitted entirely; an empty aggregation yields only
/// the total line.
pub fn render_context(stats: &EventStats) -> String {
    let mut out = format!("Total de eventos: {}\n", stats.total_events);

    let top_viewed = stats.top_viewed();
    if !top_viewed.is_empty() {
        out.push_str("\nPRODUTOS MAIS VISUALIZADOS:\n");
        for (position, entry) in top_viewed.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} - {} visualizações",
                position + 1,
                entry.name,
                entry.views
            ));
            if entry.added_to_cart > 0 {
                out.push_str(&format!(", {} adições ao carrinho", entry.added_to_cart));
            }
            if entry.purchased > 0 {
                out.push_str(&format!(", {} compras", entry.purchased));
            }
            out.push('\n');
        }
    }

    let top_purchased = stats.top_purchased();
    if !top_purchased.is_empty() {
        out.push_str("\nPRODUTOS MAIS COMPRADOS:\n");
        for (position, entry) in top_purchased.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} - {} compras",
                position + 1,
                entry.name,
                entry.purchased
            ));
            if entry.views > 0 {
                out.push_str(&format!(" ({} visualizações)", entry.views));
            }
            out.push('\n');
        }
    }

    if !stats.products.is_empty() {
        let totals = stats.totals();
        out.push_str("\nESTATÍSTICAS GERAIS:\n");
        out.push_str(&format!("- Total de visualizações: {}\n", totals.views));
        out.push_str(&format!(
            "- Total de adições ao carrinho: {}\n",
            totals.added_to_cart
        ));
        out.push_str(&format!("- Total de compras: {}\n", totals.purchased));
        if let Some(rate) = stats.conversion_rate() {
            out.push_str(&format!("- Taxa de conversão: {rate:.2}%\n"));
        }
    }

    out
}

const BASE_SYSTEM_PROMPT: &str = "\
Você é o assistente executivo e analista de negócios de uma pizzaria \
artesanal. Responde ao dono via WhatsApp, então mantenha as respostas \
curtas, diretas e em português brasileiro.

SEU PAPEL:
- Analisar dados de vendas, conversão e comportamento dos clientes
- Alertar sobre quedas de conversão e produtos com baixo desempenho
- Identificar oportunidades (combos, cross-sell, horários de promoção)
- Sempre citar números concretos quando disponíveis

FORMATO:
- Estrutura: situação, dados, impacto, ação sugerida
- Use emojis para urgência (🚨 crítico, ⚠️ atenção, 💡 oportunidade)
- Quando apontar um problema, sugira uma ação prática";

/// System prompt for the completion call. A non-empty context block is
/// appended under its own header; without one the base prompt stands
/// alone.
pub fn build_system_prompt(context: Option<&str>) -> String {
    match context {
        Some(block) if !block.trim().is_empty() => {
            format!("{BASE_SYSTEM_PROMPT}\n\n=== DADOS EM TEMPO REAL ===\n{block}")
        }
        _ => BASE_SYSTEM_PROMPT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forno_contracts::{EventPayload, ProductRef};

    fn event(product: Option<(&str, &str)>, action: Option<EventAction>) -> MenuEvent {
        MenuEvent {
            id: "evt".to_string(),
            title: "menu interaction".to_string(),
            description: None,
            kind: "menu".to_string(),
            store_id: "store-1".to_string(),
            data: Some(EventPayload {
                product: product.map(|(id, name)| ProductRef {
                    id: id.to_string(),
                    name: name.to_string(),
                }),
                action,
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn n_events(product: (&str, &str), action: EventAction, n: usize) -> Vec<MenuEvent> {
        (0..n).map(|_| event(Some(product), Some(action))).collect()
    }

    #[test]
    fn empty_event_list_renders_only_the_total_line() {
        let stats = EventStats::aggregate(&[]);
        assert!(stats.top_viewed().is_empty());
        assert!(stats.top_purchased().is_empty());
        assert_eq!(render_context(&stats), "Total de eventos: 0\n");
    }

    #[test]
    fn events_without_product_count_toward_total_only() {
        let events = vec![
            MenuEvent {
                data: None,
                ..event(None, None)
            },
            event(None, Some(EventAction::View)),
            event(Some(("p1", "Pizza")), Some(EventAction::View)),
        ];
        let stats = EventStats::aggregate(&events);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.products().len(), 1);
        assert_eq!(stats.totals().views, 1);
    }

    #[test]
    fn unknown_actions_increment_nothing_but_register_the_product() {
        let events = vec![event(Some(("p1", "Pizza")), Some(EventAction::Unknown))];
        let stats = EventStats::aggregate(&events);
        let entry = &stats.products()[0];
        assert_eq!(
            (entry.views, entry.added_to_cart, entry.purchased, entry.removed),
            (0, 0, 0, 0)
        );
    }

    #[test]
    fn top_viewed_is_capped_at_ten_with_stable_ties() {
        let mut events = Vec::new();
        // twelve products, all with a single view; ties resolve in
        // encounter order, so the first ten survive
        for i in 0..12 {
            let id = format!("p{i}");
            let name = format!("Produto {i}");
            events.push(event(Some((&id, &name)), Some(EventAction::View)));
        }
        let stats = EventStats::aggregate(&events);
        let top = stats.top_viewed();
        assert_eq!(top.len(), 10);
        assert_eq!(top[0].product_id, "p0");
        assert_eq!(top[9].product_id, "p9");
    }

    #[test]
    fn top_purchased_only_lists_purchased_products() {
        let mut events = n_events(("p1", "Pizza"), EventAction::View, 4);
        events.extend(n_events(("p2", "Refrigerante"), EventAction::Purchase, 2));
        events.extend(n_events(("p3", "Calzone"), EventAction::AddToCart, 3));
        let stats = EventStats::aggregate(&events);
        let top = stats.top_purchased();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].product_id, "p2");
        assert!(top.len() <= TOP_PURCHASED_LIMIT);
    }

    #[test]
    fn conversion_rate_is_none_without_views() {
        let events = n_events(("p1", "Pizza"), EventAction::Purchase, 3);
        let stats = EventStats::aggregate(&events);
        assert_eq!(stats.conversion_rate(), None);
        assert!(!render_context(&stats).contains("Taxa de conversão"));
    }

    #[test]
    fn conversion_rate_renders_with_two_decimals() {
        let mut events = n_events(("p1", "Pizza"), EventAction::View, 3);
        events.extend(n_events(("p1", "Pizza"), EventAction::Purchase, 1));
        let stats = EventStats::aggregate(&events);
        let rendered = render_context(&stats);
        assert!(rendered.contains("- Taxa de conversão: 33.33%\n"), "{rendered}");
    }

    #[test]
    fn context_sections_follow_the_fixed_structure() {
        let mut events = n_events(("p1", "Pizza Média"), EventAction::View, 5);
        events.extend(n_events(("p1", "Pizza Média"), EventAction::AddToCart, 2));
        events.extend(n_events(("p1", "Pizza Média"), EventAction::Purchase, 1));
        events.extend(n_events(("p2", "Refrigerante"), EventAction::View, 1));
        let stats = EventStats::aggregate(&events);
        let rendered = render_context(&stats);

        assert!(rendered.starts_with("Total de eventos: 9\n"));
        let viewed = rendered.find("PRODUTOS MAIS VISUALIZADOS").unwrap();
        let purchased = rendered.find("PRODUTOS MAIS COMPRADOS").unwrap();
        let general = rendered.find("ESTATÍSTICAS GERAIS").unwrap();
        assert!(viewed < purchased && purchased < general);
        assert!(rendered
            .contains("1. Pizza Média - 5 visualizações, 2 adições ao carrinho, 1 compras\n"));
        assert!(rendered.contains("1. Pizza Média - 1 compras (5 visualizações)\n"));
        assert!(rendered.contains("- Taxa de conversão: 16.67%\n"));
    }

    #[test]
    fn system_prompt_embeds_context_when_present() {
        let with = build_system_prompt(Some("Total de eventos: 3\n"));
        assert!(with.contains("=== DADOS EM TEMPO REAL ==="));
        assert!(with.contains("Total de eventos: 3"));

        let without = build_system_prompt(None);
        assert!(!without.contains("=== DADOS EM TEMPO REAL ==="));
        assert_eq!(build_system_prompt(Some("   ")), without);
    }
}
